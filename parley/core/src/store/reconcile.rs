//! Folds one streamed reply into the store
//!
//! The reconciler is the [`StreamCallbacks`] of a single send. It owns the
//! ids of the optimistic user message and the assistant placeholder, and
//! swaps each for its server copy as the stream confirms them.

use std::sync::Weak;

use parking_lot::Mutex;

use super::{ConversationStore, StoreEvent, StoreInner};
use crate::conversation::ConversationId;
use crate::error::StreamError;
use crate::messages::{Attachment, Message, MessageId};
use crate::streaming::{ChunkPayload, StreamCallbacks};

pub(crate) struct SendReconciler {
    store: Weak<StoreInner>,
    conversation_id: ConversationId,
    optimistic_id: Mutex<MessageId>,
    placeholder_id: Mutex<Option<MessageId>>,
    text: String,
    attachments: Vec<Attachment>,
}

impl SendReconciler {
    pub(crate) fn new(
        store: Weak<StoreInner>,
        conversation_id: ConversationId,
        optimistic_id: MessageId,
        text: String,
        attachments: Vec<Attachment>,
    ) -> Self {
        Self {
            store,
            conversation_id,
            optimistic_id: Mutex::new(optimistic_id),
            placeholder_id: Mutex::new(None),
            text,
            attachments,
        }
    }

    fn store(&self) -> Option<ConversationStore> {
        self.store.upgrade().map(ConversationStore::from_inner)
    }

    /// Id of the placeholder, inserting one on first use
    fn ensure_placeholder(&self, store: &ConversationStore) -> MessageId {
        let mut slot = self.placeholder_id.lock();
        if let Some(id) = slot.as_ref() {
            return id.clone();
        }
        let placeholder = Message::placeholder();
        let id = placeholder.id.clone();
        store.add_message(&self.conversation_id, placeholder);
        *slot = Some(id.clone());
        id
    }

    /// Remove the placeholder, if one was inserted
    pub(crate) fn discard_placeholder(&self) {
        let Some(id) = self.placeholder_id.lock().take() else {
            return;
        };
        if let Some(store) = self.store() {
            store.remove_message(&self.conversation_id, &id);
        }
    }
}

impl StreamCallbacks for SendReconciler {
    fn on_user_message(&self, mut message: Message) {
        let Some(store) = self.store() else { return };
        message.is_user = true;

        let mut optimistic_id = self.optimistic_id.lock();
        // Echoes often omit the attachments the user picked
        if !message.has_attachments() {
            if let Some(local) = store.message(&self.conversation_id, &optimistic_id) {
                message.images = local.images;
                message.files = local.files;
            }
        }
        let confirmed_id = message.id.clone();
        store.replace_message(&self.conversation_id, &optimistic_id, message);
        *optimistic_id = confirmed_id;
    }

    fn on_ai_start(&self, _message_id: Option<MessageId>) {
        if let Some(store) = self.store() {
            self.ensure_placeholder(&store);
        }
    }

    fn on_ai_chunk(&self, chunk: ChunkPayload) {
        let Some(store) = self.store() else { return };
        let placeholder_id = self.ensure_placeholder(&store);
        let Some(mut current) = store.message(&self.conversation_id, &placeholder_id) else {
            return;
        };

        if !chunk.full_content.is_empty() {
            current.text = chunk.full_content;
            current.is_thinking = false;
        }
        current.is_streaming = true;
        store.update_message(&self.conversation_id, current);
    }

    fn on_complete(&self, mut message: Message) {
        let Some(store) = self.store() else { return };
        message.is_user = false;
        message.is_streaming = false;
        message.is_thinking = false;

        match self.placeholder_id.lock().take() {
            Some(placeholder_id) => {
                if message.text.is_empty() {
                    if let Some(streamed) = store.message(&self.conversation_id, &placeholder_id) {
                        message.text = streamed.text;
                    }
                }
                store.replace_message(&self.conversation_id, &placeholder_id, message);
            }
            None => {
                store.update_message(&self.conversation_id, message);
            }
        }

        tracing::debug!(conversation_id = %self.conversation_id, "Reply reconciled");
        store.finish_send(self);
    }

    fn on_error(&self, error: StreamError) {
        self.discard_placeholder();
        let Some(store) = self.store() else { return };

        // Never confirmed by the server: the restored input replaces it
        let optimistic_id = self.optimistic_id.lock().clone();
        if optimistic_id.is_transient() {
            store.remove_message(&self.conversation_id, &optimistic_id);
        }

        tracing::warn!(conversation_id = %self.conversation_id, error = %error, "Send failed");
        store.emit(StoreEvent::SendFailed {
            conversation_id: self.conversation_id.clone(),
            text: self.text.clone(),
            attachments: self.attachments.clone(),
        });
        if error.is_user_visible() {
            store.emit(StoreEvent::Alert(error.to_string()));
        }
        store.finish_send(self);
    }

    fn on_cancelled(&self) {
        self.discard_placeholder();
        if let Some(store) = self.store() {
            tracing::debug!(conversation_id = %self.conversation_id, "Send cancelled");
            store.finish_send(self);
        }
    }
}

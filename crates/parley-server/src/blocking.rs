//! Block / unblock.
//!
//! Blocking never touches history. When the relation actually changes and
//! the two users share a conversation, a label message records it and is
//! fanned out to both sides.

use chrono::Utc;
use tracing::info;

use parley_shared::constants::{LABEL_BLOCKED, LABEL_UNBLOCKED};
use parley_shared::protocol::ServerEvent;
use parley_shared::UserId;
use parley_store::{blocks, conversations, messages, users, Message};

use crate::db::Store;
use crate::error::ServerError;
use crate::hub::EventHub;

pub const MSG_CANNOT_BLOCK_SELF: &str = "You Can't Block Yourself";
pub const MSG_BLOCKED: &str = "User Has been Blocked Successfully";
pub const MSG_UNBLOCKED: &str = "User Has been Unblocked Successfully";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Block,
    Unblock,
}

impl Action {
    fn label(self) -> &'static str {
        match self {
            Self::Block => LABEL_BLOCKED,
            Self::Unblock => LABEL_UNBLOCKED,
        }
    }
}

#[derive(Clone)]
pub struct BlockService {
    store: Store,
    hub: EventHub,
}

impl BlockService {
    pub fn new(store: Store, hub: EventHub) -> Self {
        Self { store, hub }
    }

    /// Add `target` to `actor`'s block set. Returns the label message when
    /// one was recorded.
    pub async fn block(&self, actor: UserId, target: UserId) -> Result<Option<Message>, ServerError> {
        self.apply(actor, target, Action::Block).await
    }

    pub async fn unblock(
        &self,
        actor: UserId,
        target: UserId,
    ) -> Result<Option<Message>, ServerError> {
        self.apply(actor, target, Action::Unblock).await
    }

    async fn apply(
        &self,
        actor: UserId,
        target: UserId,
        action: Action,
    ) -> Result<Option<Message>, ServerError> {
        if actor == target {
            return Err(ServerError::Validation(MSG_CANNOT_BLOCK_SELF.to_string()));
        }

        let now = Utc::now();
        let label = self
            .store
            .transaction(move |tx| {
                users::get(tx, target)?;
                let changed = match action {
                    Action::Block => blocks::block(tx, actor, target, now)?,
                    Action::Unblock => blocks::unblock(tx, actor, target)?,
                };
                if !changed {
                    return Ok(None);
                }
                let Some(conversation) = conversations::find_by_participants(tx, actor, target)?
                else {
                    return Ok(None);
                };
                let label = Message::label(conversation.id, action.label(), now);
                messages::insert(tx, &label)?;
                Ok(Some(label))
            })
            .await?;

        info!(actor = %actor, target = %target, ?action, recorded = label.is_some(), "block relation updated");

        if let Some(label) = &label {
            for participant in [actor, target] {
                let mut view = label.view_for(participant);
                view.is_my_msg = participant == actor;
                self.hub.emit(participant, ServerEvent::Message(view)).await;
            }
        }
        Ok(label)
    }
}

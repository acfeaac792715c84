//! Blocking prompt/response channel to the human running the node.
//!
//! Peers never talk to stdin directly: they hand a [`Prompt`] to whoever
//! holds the receiving end (the serve console, or a test script) and wait
//! for the answer. Only the asking peer's dispatch loop waits.

use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::protocol::FileAdvert;

/// An incoming folder the operator has never seen.
#[derive(Debug, Clone)]
pub struct FolderOffer {
    pub from: String,
    pub folder_id: u32,
    pub files: Vec<FileAdvert>,
}

/// Where the operator wants an accepted folder created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acceptance {
    pub directory: PathBuf,
    pub name: String,
}

#[derive(Debug)]
pub struct Prompt {
    pub offer: FolderOffer,
    pub reply: oneshot::Sender<Option<Acceptance>>,
}

#[derive(Clone)]
pub struct Operator {
    tx: mpsc::Sender<Prompt>,
}

impl Operator {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Prompt>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Asks whether to accept `offer`. `None` means declined, or nobody is
    /// listening.
    pub async fn review(&self, offer: FolderOffer) -> Option<Acceptance> {
        let (reply, answer) = oneshot::channel();
        if self.tx.send(Prompt { offer, reply }).await.is_err() {
            warn!("no operator attached, declining folder offer");
            return None;
        }
        answer.await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> FolderOffer {
        FolderOffer {
            from: "alice".into(),
            folder_id: 7,
            files: Vec::new(),
        }
    }

    #[tokio::test]
    async fn answer_reaches_the_asker() {
        let (operator, mut prompts) = Operator::channel(1);
        tokio::spawn(async move {
            let prompt = prompts.recv().await.unwrap();
            assert_eq!(prompt.offer.folder_id, 7);
            let _ = prompt.reply.send(Some(Acceptance {
                directory: "/tmp/x".into(),
                name: "docs".into(),
            }));
        });
        let acceptance = operator.review(offer()).await.unwrap();
        assert_eq!(acceptance.name, "docs");
    }

    #[tokio::test]
    async fn missing_operator_declines() {
        let (operator, prompts) = Operator::channel(1);
        drop(prompts);
        assert!(operator.review(offer()).await.is_none());
    }

    #[tokio::test]
    async fn dropped_reply_declines() {
        let (operator, mut prompts) = Operator::channel(1);
        tokio::spawn(async move {
            let prompt = prompts.recv().await.unwrap();
            drop(prompt.reply);
        });
        assert!(operator.review(offer()).await.is_none());
    }
}

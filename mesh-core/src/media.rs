//! Media negotiation boundary. The core carries offers and answers; producing them is the
//! media layer's job.

use crate::contact::Contact;

pub trait MediaNegotiator: Send + Sync {
    /// Produce an answer for `offer` from `contact`, or abort the call.
    fn answer(&self, contact: &Contact, offer: &str) -> Result<String, MediaError>;
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("no media layer available")]
    Unavailable,
    #[error("negotiation aborted: {0}")]
    Aborted(String),
}

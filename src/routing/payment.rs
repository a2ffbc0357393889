//! Payment authorization for priced answers
//!
//! A provider quotes a price by answering without a payload. The requester's
//! [`PaymentAuthorizer`] turns the quote into a [`PaymentProof`], which the
//! provider checks with its own authorizer before releasing the answer.

use crate::identity::AgentId;
use crate::protocol::messages::{PaymentProof, PriceQuote};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Payment declined: {reason}")]
pub struct PaymentDeclined {
    pub reason: String,
}

impl PaymentDeclined {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Issues and checks payment proofs
#[async_trait::async_trait]
pub trait PaymentAuthorizer: Send + Sync {
    /// Pay `quote` on behalf of `payer`
    async fn authorize(
        &self,
        quote: &PriceQuote,
        payer: &AgentId,
    ) -> Result<PaymentProof, PaymentDeclined>;

    /// Whether `proof` is a valid payment for `quote`
    fn verify(&self, proof: &PaymentProof, quote: &PriceQuote) -> bool;
}

/// Authorizer for nodes without a payment setup: pays nothing, accepts nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPayments;

#[async_trait::async_trait]
impl PaymentAuthorizer for NoPayments {
    async fn authorize(
        &self,
        _quote: &PriceQuote,
        _payer: &AgentId,
    ) -> Result<PaymentProof, PaymentDeclined> {
        Err(PaymentDeclined::new("payments are not configured"))
    }

    fn verify(&self, _proof: &PaymentProof, _quote: &PriceQuote) -> bool {
        false
    }
}

/// Tokens are SHA-256 digests over a secret shared by every node in a closed
/// deployment, bound to payer, provider, topic and amount
#[derive(Clone)]
pub struct DigestPaymentAuthorizer {
    secret: String,
}

impl fmt::Debug for DigestPaymentAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestPaymentAuthorizer")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl DigestPaymentAuthorizer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn token(&self, payer: &AgentId, quote: &PriceQuote) -> String {
        let topic = quote.topic.to_string();
        let amount = quote.price.amount.to_string();
        let mut hasher = Sha256::new();
        for part in [
            self.secret.as_str(),
            payer.as_str(),
            quote.provider.as_str(),
            topic.as_str(),
            amount.as_str(),
            quote.price.currency.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

#[async_trait::async_trait]
impl PaymentAuthorizer for DigestPaymentAuthorizer {
    async fn authorize(
        &self,
        quote: &PriceQuote,
        payer: &AgentId,
    ) -> Result<PaymentProof, PaymentDeclined> {
        debug!(provider = %quote.provider, amount = quote.price.amount, "Issuing payment proof");
        Ok(PaymentProof {
            payer: payer.clone(),
            provider: quote.provider.clone(),
            topic: quote.topic.clone(),
            amount: quote.price.amount,
            currency: quote.price.currency.clone(),
            token: self.token(payer, quote),
        })
    }

    fn verify(&self, proof: &PaymentProof, quote: &PriceQuote) -> bool {
        proof.covers(quote) && proof.token == self.token(&proof.payer, quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;
    use crate::protocol::messages::Price;
    use crate::protocol::topics::TopicPath;

    fn agent(seed: u8) -> AgentId {
        NodeIdentity::from_seed(&[seed; 32]).agent_id().clone()
    }

    fn quote(amount: u64) -> PriceQuote {
        PriceQuote {
            provider: agent(1),
            topic: TopicPath::parse("finance/tax").unwrap(),
            price: Price {
                amount,
                currency: "EUR".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_digest_proof_verifies() {
        let authorizer = DigestPaymentAuthorizer::new("s3cret");
        let proof = authorizer.authorize(&quote(250), &agent(2)).await.unwrap();
        assert!(authorizer.verify(&proof, &quote(250)));
        assert!(!authorizer.verify(&proof, &quote(100)));
    }

    #[tokio::test]
    async fn test_digest_rejects_other_secret_and_forged_payer() {
        let ours = DigestPaymentAuthorizer::new("s3cret");
        let theirs = DigestPaymentAuthorizer::new("other");
        let proof = theirs.authorize(&quote(250), &agent(2)).await.unwrap();
        assert!(!ours.verify(&proof, &quote(250)));

        let mut forged = ours.authorize(&quote(250), &agent(2)).await.unwrap();
        forged.payer = agent(3);
        assert!(!ours.verify(&forged, &quote(250)));
    }

    #[test]
    fn test_no_payments_declines() {
        let result = tokio_test::block_on(NoPayments.authorize(&quote(1), &agent(2)));
        assert!(result.is_err());
        assert!(!format!("{:?}", DigestPaymentAuthorizer::new("s3cret")).contains("s3cret"));
    }
}

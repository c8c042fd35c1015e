//! In-memory relationship cards.
//!
//! Cards are signed statements relating two identities. They are held in
//! memory only, verified on insertion, and bounded in both payload size
//! and per-identity count.

use std::collections::HashMap;

use homenet_crypto::VerifyingKey;
use homenet_proto::messages::{
    conversation_response, response, AddRelatedIdentityRequest, AddRelatedIdentityResponse,
    ConversationResponse, GetIdentityRelationshipsRequest, GetIdentityRelationshipsResponse,
    RelationshipCard, RemoveRelatedIdentityRequest, RemoveRelatedIdentityResponse, Response,
    Status,
};
use homenet_search::TextPredicate;
use homenet_types::{IdentityId, MAX_RELATIONSHIP_PAYLOAD_BYTES};

use crate::conversation::{Conversation, Reply};
use crate::Result;

/// Cards one identity may accumulate.
pub const MAX_CARDS_PER_IDENTITY: usize = 100;

/// In-memory card store, keyed by the card's recipient identity.
#[derive(Default)]
pub struct RelationshipStore {
    cards: HashMap<IdentityId, Vec<RelationshipCard>>,
}

/// Why a card was not accepted.
#[derive(Debug, PartialEq, Eq)]
pub enum AddCardError {
    Duplicate,
    QuotaExceeded,
}

impl RelationshipStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a verified card to an identity.
    pub fn add(
        &mut self,
        identity: IdentityId,
        card: RelationshipCard,
    ) -> std::result::Result<(), AddCardError> {
        let cards = self.cards.entry(identity).or_default();
        if cards.iter().any(|c| c.card_id == card.card_id) {
            return Err(AddCardError::Duplicate);
        }
        if cards.len() >= MAX_CARDS_PER_IDENTITY {
            return Err(AddCardError::QuotaExceeded);
        }
        cards.push(card);
        Ok(())
    }

    /// Detach a card by id. Returns whether it existed.
    pub fn remove(&mut self, identity: &IdentityId, card_id: &[u8]) -> bool {
        match self.cards.get_mut(identity) {
            Some(cards) => {
                let before = cards.len();
                cards.retain(|c| c.card_id != card_id);
                cards.len() != before
            }
            None => false,
        }
    }

    /// Cards attached to an identity, filtered by type wildcard and
    /// optional issuer key.
    pub fn list(
        &self,
        identity: &IdentityId,
        card_type: Option<&TextPredicate>,
        issuer: &[u8],
    ) -> Vec<RelationshipCard> {
        self.cards
            .get(identity)
            .map(|cards| {
                cards
                    .iter()
                    .filter(|c| card_type.map_or(true, |p| p.matches(&c.card_type)))
                    .filter(|c| issuer.is_empty() || c.issuer_public_key == issuer)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn conv_ok(kind: conversation_response::Kind) -> Reply {
    Reply::ok(Response::ok(response::Kind::Conversation(
        ConversationResponse { kind: Some(kind) },
    )))
}

impl Conversation {
    pub(crate) fn handle_add_related_identity(
        &mut self,
        req: &AddRelatedIdentityRequest,
    ) -> Result<Reply> {
        let Some(identity) = self.identity else {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        };
        let Some(card) = req.card.clone() else {
            return Ok(Reply::ok(Response::invalid_value("card")));
        };

        if card.card_id.is_empty() {
            return Ok(Reply::ok(Response::invalid_value("cardId")));
        }
        if card.payload.len() > MAX_RELATIONSHIP_PAYLOAD_BYTES {
            return Ok(Reply::ok(Response::invalid_value("payload")));
        }
        let Some(peer_key) = self.peer_key.as_ref() else {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        };
        if card.recipient_public_key != peer_key.to_bytes().to_vec() {
            return Ok(Reply::ok(Response::invalid_value("recipientPublicKey")));
        }
        let issuer = match VerifyingKey::from_slice(&card.issuer_public_key) {
            Ok(key) => key,
            Err(_) => return Ok(Reply::ok(Response::invalid_value("issuerPublicKey"))),
        };
        if issuer
            .verify_slice(&card.signable_bytes(), &card.issuer_signature)
            .is_err()
        {
            return Ok(Reply::close(Response::error(Status::ErrorSignature)));
        }

        let outcome = match self.ctx.relationships.lock() {
            Ok(mut store) => store.add(identity, card),
            Err(_) => return Ok(Reply::error(Status::ErrorInternal)),
        };
        match outcome {
            Ok(()) => Ok(conv_ok(conversation_response::Kind::AddRelatedIdentity(
                AddRelatedIdentityResponse {},
            ))),
            Err(AddCardError::Duplicate) => Ok(Reply::error(Status::ErrorAlreadyExists)),
            Err(AddCardError::QuotaExceeded) => Ok(Reply::error(Status::ErrorQuotaExceeded)),
        }
    }

    pub(crate) fn handle_remove_related_identity(
        &mut self,
        req: &RemoveRelatedIdentityRequest,
    ) -> Result<Reply> {
        let Some(identity) = self.identity else {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        };
        let removed = match self.ctx.relationships.lock() {
            Ok(mut store) => store.remove(&identity, &req.card_id),
            Err(_) => return Ok(Reply::error(Status::ErrorInternal)),
        };
        if !removed {
            return Ok(Reply::error(Status::ErrorNotFound));
        }
        Ok(conv_ok(conversation_response::Kind::RemoveRelatedIdentity(
            RemoveRelatedIdentityResponse {},
        )))
    }

    pub(crate) fn handle_get_identity_relationships(
        &mut self,
        req: &GetIdentityRelationshipsRequest,
    ) -> Result<Reply> {
        let Ok(identity) = IdentityId::from_slice(&req.identity_id) else {
            return Ok(Reply::ok(Response::invalid_value("identityId")));
        };
        let card_type = TextPredicate::translate(&req.card_type);
        let cards = match self.ctx.relationships.lock() {
            Ok(store) => store.list(&identity, card_type.as_ref(), &req.issuer_public_key),
            Err(_) => return Ok(Reply::error(Status::ErrorInternal)),
        };
        Ok(conv_ok(
            conversation_response::Kind::GetIdentityRelationships(
                GetIdentityRelationshipsResponse { cards },
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(id: u8, card_type: &str) -> RelationshipCard {
        RelationshipCard {
            card_id: vec![id],
            issuer_public_key: vec![1u8; 32],
            recipient_public_key: vec![2u8; 32],
            card_type: card_type.to_string(),
            valid_from: 0,
            valid_to: 0,
            payload: Vec::new(),
            issuer_signature: Vec::new(),
        }
    }

    fn identity(byte: u8) -> IdentityId {
        IdentityId::from_bytes([byte; 20])
    }

    #[test]
    fn test_add_and_list() {
        let mut store = RelationshipStore::new();
        store.add(identity(1), card(1, "friend")).expect("add");
        store.add(identity(1), card(2, "coworker")).expect("add");

        assert_eq!(store.list(&identity(1), None, &[]).len(), 2);
        assert_eq!(store.list(&identity(2), None, &[]).len(), 0);
    }

    #[test]
    fn test_duplicate_card_id_rejected() {
        let mut store = RelationshipStore::new();
        store.add(identity(1), card(1, "friend")).expect("add");
        assert_eq!(
            store.add(identity(1), card(1, "friend")),
            Err(AddCardError::Duplicate)
        );
    }

    #[test]
    fn test_per_identity_quota() {
        let mut store = RelationshipStore::new();
        for i in 0..MAX_CARDS_PER_IDENTITY {
            store
                .add(identity(1), card(i as u8, "t"))
                .expect("add within quota");
        }
        assert_eq!(
            store.add(identity(1), card(200, "t")),
            Err(AddCardError::QuotaExceeded)
        );
    }

    #[test]
    fn test_type_wildcard_filter() {
        let mut store = RelationshipStore::new();
        store.add(identity(1), card(1, "friend")).expect("add");
        store.add(identity(1), card(2, "family")).expect("add");
        store.add(identity(1), card(3, "coworker")).expect("add");

        let pred = TextPredicate::translate("f*");
        assert_eq!(store.list(&identity(1), pred.as_ref(), &[]).len(), 2);
    }

    #[test]
    fn test_issuer_filter() {
        let mut store = RelationshipStore::new();
        let mut other = card(2, "friend");
        other.issuer_public_key = vec![9u8; 32];
        store.add(identity(1), card(1, "friend")).expect("add");
        store.add(identity(1), other).expect("add");

        assert_eq!(store.list(&identity(1), None, &[9u8; 32]).len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut store = RelationshipStore::new();
        store.add(identity(1), card(1, "friend")).expect("add");
        assert!(store.remove(&identity(1), &[1]));
        assert!(!store.remove(&identity(1), &[1]));
        assert!(store.list(&identity(1), None, &[]).is_empty());
    }
}

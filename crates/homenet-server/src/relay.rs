//! Application-service relay handlers.
//!
//! A checked-in conversation on the app-service role registers named
//! channels; another checked-in conversation calls one of them, and from
//! then on the server forwards opaque bytes one-to-one between the pair
//! without inspecting them. Idle pairs are torn down after 60 seconds.

use homenet_proto::messages::{
    conversation_response, response, ApplicationServiceAddRequest, ApplicationServiceAddResponse,
    ApplicationServiceCallRequest, ApplicationServiceCallResponse,
    ApplicationServiceSendMessageRequest, ApplicationServiceSendMessageResponse,
    ConversationResponse, Response, Status,
};
use homenet_types::IdentityId;

use crate::conversation::{Conversation, ConversationStatus, Reply};
use crate::registry::{CallError, RelayEvent};
use crate::Result;

/// Maximum channels one conversation may register.
pub const MAX_CHANNELS_PER_CONVERSATION: usize = 32;

fn conv_ok(kind: conversation_response::Kind) -> Reply {
    Reply::ok(Response::ok(response::Kind::Conversation(
        ConversationResponse { kind: Some(kind) },
    )))
}

impl Conversation {
    pub(crate) fn handle_app_service_add(
        &mut self,
        req: &ApplicationServiceAddRequest,
    ) -> Result<Reply> {
        let Some(identity) = self.identity else {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        };
        if req.service_names.is_empty()
            || req.service_names.len() > MAX_CHANNELS_PER_CONVERSATION
        {
            return Ok(Reply::ok(Response::invalid_value("serviceNames")));
        }
        if req.service_names.iter().any(|n| n.is_empty() || n.len() > 64) {
            return Ok(Reply::ok(Response::invalid_value("serviceNames")));
        }

        self.ctx
            .registry
            .add_channels(self.conn_id, identity, &req.service_names);
        tracing::debug!(
            identity = %identity,
            channels = req.service_names.len(),
            "application-service channels registered"
        );
        Ok(conv_ok(conversation_response::Kind::AppServiceAdd(
            ApplicationServiceAddResponse {},
        )))
    }

    pub(crate) fn handle_app_service_call(
        &mut self,
        req: &ApplicationServiceCallRequest,
    ) -> Result<Reply> {
        let Ok(callee) = IdentityId::from_slice(&req.identity_id) else {
            return Ok(Reply::ok(Response::invalid_value("identityId")));
        };
        if req.service_name.is_empty() {
            return Ok(Reply::ok(Response::invalid_value("serviceName")));
        }

        match self
            .ctx
            .registry
            .call(self.conn_id, &callee, &req.service_name)
        {
            Ok(peer) => {
                self.relay_peer = Some(peer);
                self.status = ConversationStatus::Relaying;
                tracing::debug!(callee = %callee, service = %req.service_name, "relay established");
                Ok(conv_ok(conversation_response::Kind::AppServiceCall(
                    ApplicationServiceCallResponse {},
                )))
            }
            Err(CallError::NotFound) => Ok(Reply::error(Status::ErrorNotFound)),
            Err(CallError::Busy) => Ok(Reply::ok(Response::busy(60))),
        }
    }

    pub(crate) async fn handle_app_service_send(
        &mut self,
        req: ApplicationServiceSendMessageRequest,
    ) -> Result<Reply> {
        let Some(peer) = self.relay_peer else {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        };
        let Some(sender) = self.ctx.registry.relay_sender(peer) else {
            self.teardown_relay();
            return Ok(Reply::error(Status::ErrorNotFound));
        };

        if sender.send(RelayEvent::Data(req.message)).await.is_err() {
            self.teardown_relay();
            return Ok(Reply::error(Status::ErrorNotFound));
        }
        Ok(conv_ok(conversation_response::Kind::AppServiceSendMessage(
            ApplicationServiceSendMessageResponse {},
        )))
    }
}

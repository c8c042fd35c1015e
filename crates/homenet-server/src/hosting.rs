//! Hosting-agreement handlers: registration, check-in, profile update,
//! cancellation, and the lightweight identity lookup.

use homenet_crypto::{identity_id, sha256};
use homenet_db::queries::identities;
use homenet_db::DbError;
use homenet_images::{ImageKind, ImageStoreError};
use homenet_proto::messages::{
    conversation_response, response, single_response, CancelHostingAgreementResponse,
    CheckInRequest, CheckInResponse, ConversationResponse, GetIdentityInformationRequest,
    GetIdentityInformationResponse, ProfileInformation, RegisterHostingResponse, Response,
    SingleResponse, Status, UpdateProfileRequest, UpdateProfileResponse, UPDATE_EXTRA_DATA,
    UPDATE_IMAGE, UPDATE_LOCATION, UPDATE_NAME, UPDATE_THUMBNAIL, UPDATE_VERSION,
};
use homenet_types::{
    IdentityId, ImageHandle, Profile, ProfileScope, ProfileVersion, TypesError,
};

use crate::conversation::{Conversation, ConversationStatus, Reply};
use crate::Result;

fn invalid_from_types(error: &TypesError) -> Response {
    match error {
        TypesError::InvalidValue { field, .. } => Response::invalid_value(*field),
    }
}

fn conv_ok(kind: conversation_response::Kind) -> Reply {
    Reply::ok(Response::ok(response::Kind::Conversation(
        ConversationResponse { kind: Some(kind) },
    )))
}

impl Conversation {
    pub(crate) async fn handle_register_hosting(&mut self) -> Result<Reply> {
        if self.status >= ConversationStatus::Verified {
            return Ok(Reply::error(Status::ErrorAlreadyExists));
        }
        let Some(peer_key) = self.peer_key.clone() else {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        };
        let id = identity_id(peer_key.as_bytes());
        let now = self.ctx.now();

        {
            let conn = self.ctx.db.lock().await;
            match identities::get_hosted(&conn, &id) {
                Ok(existing) => {
                    // Idempotent retry with the same key; a cancelled
                    // agreement is reactivated.
                    if existing.expires_at.is_some() {
                        identities::set_expiration(&conn, &id, None)?;
                    }
                }
                Err(DbError::NotFound(_)) => {
                    if identities::count_hosted_active(&conn)?
                        >= self.ctx.limits.max_hosted_identities
                    {
                        return Ok(Reply::error(Status::ErrorQuotaExceeded));
                    }
                    let blank = Profile {
                        identity_id: id,
                        public_key: peer_key.to_bytes().to_vec(),
                        profile_type: String::new(),
                        name: String::new(),
                        version: ProfileVersion::default(),
                        location: homenet_types::GpsLocation::default(),
                        extra_data: String::new(),
                        profile_image: None,
                        thumbnail_image: None,
                        expires_at: None,
                        scope: ProfileScope::Hosted,
                    };
                    identities::insert(&conn, &blank, now)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.status = ConversationStatus::Verified;
        tracing::info!(identity = %id, "hosting agreement established");
        Ok(conv_ok(conversation_response::Kind::RegisterHosting(
            RegisterHostingResponse {},
        )))
    }

    pub(crate) async fn handle_check_in(&mut self, req: &CheckInRequest) -> Result<Reply> {
        let Some(peer_key) = self.peer_key.clone() else {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        };
        if req.challenge != self.server_challenge {
            return Ok(Reply::ok(Response::invalid_value("challenge")));
        }
        if peer_key
            .verify_slice(&req.signable_bytes(), &req.signature)
            .is_err()
        {
            return Ok(Reply::close(Response::error(Status::ErrorSignature)));
        }

        let id = identity_id(peer_key.as_bytes());
        {
            let conn = self.ctx.db.lock().await;
            match identities::get_hosted(&conn, &id) {
                Ok(profile) => {
                    if profile.expires_at.is_some() {
                        return Ok(Reply::error(Status::ErrorExpired));
                    }
                }
                Err(DbError::NotFound(_)) => return Ok(Reply::error(Status::ErrorNotFound)),
                Err(e) => return Err(e.into()),
            }
        }

        self.identity = Some(id);
        self.status = ConversationStatus::CheckedIn;
        self.ctx.registry.set_identity(self.conn_id, id);
        tracing::debug!(identity = %id, "checked in");
        Ok(conv_ok(conversation_response::Kind::CheckIn(
            CheckInResponse {},
        )))
    }

    pub(crate) async fn handle_update_profile(
        &mut self,
        req: UpdateProfileRequest,
    ) -> Result<Reply> {
        let Some(peer_key) = self.peer_key.clone() else {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        };
        let Some(ref info) = req.profile else {
            return Ok(Reply::ok(Response::invalid_value("profile")));
        };
        if req.set_fields == 0 {
            return Ok(Reply::ok(Response::invalid_value("setFields")));
        }
        if info.public_key != peer_key.to_bytes().to_vec() {
            return Ok(Reply::ok(Response::invalid_value("publicKey")));
        }
        if peer_key
            .verify_slice(&info.signable_bytes(), &req.signature)
            .is_err()
        {
            return Ok(Reply::close(Response::error(Status::ErrorSignature)));
        }
        let new_profile = match info.to_profile(ProfileScope::Hosted) {
            Ok(profile) => profile,
            Err(e) => return Ok(Reply::ok(invalid_from_types(&e))),
        };

        let id = new_profile.identity_id;
        let stored = {
            let conn = self.ctx.db.lock().await;
            match identities::get_hosted(&conn, &id) {
                Ok(profile) => profile,
                Err(DbError::NotFound(_)) => return Ok(Reply::error(Status::ErrorNotFound)),
                Err(e) => return Err(e.into()),
            }
        };
        if stored.expires_at.is_some() {
            return Ok(Reply::error(Status::ErrorExpired));
        }

        let was_initialized = stored.version.is_initialized();
        if let Some(reject) = check_field_consistency(&req, &info, &new_profile, &stored) {
            return Ok(Reply::ok(reject));
        }

        // Store changed image blobs before the row transaction; the caps
        // are enforced here, before anything durable changes.
        let profile_image = match self
            .updated_image(
                req.set_fields & UPDATE_IMAGE != 0,
                &req.profile_image,
                &info.profile_image_hash,
                ImageKind::Profile,
                stored.profile_image,
            )
            .await
        {
            Ok(handle) => handle,
            Err(reject) => return Ok(Reply::ok(reject)),
        };
        let thumbnail_image = match self
            .updated_image(
                req.set_fields & UPDATE_THUMBNAIL != 0,
                &req.thumbnail_image,
                &info.thumbnail_image_hash,
                ImageKind::Thumbnail,
                stored.thumbnail_image,
            )
            .await
        {
            Ok(handle) => handle,
            Err(reject) => return Ok(Reply::ok(reject)),
        };

        let mut updated = stored.clone();
        updated.version = new_profile.version;
        if req.set_fields & UPDATE_NAME != 0 {
            updated.name = new_profile.name.clone();
        }
        if req.set_fields & UPDATE_LOCATION != 0 {
            updated.location = new_profile.location;
        }
        if req.set_fields & UPDATE_EXTRA_DATA != 0 {
            updated.extra_data = new_profile.extra_data.clone();
        }
        if !was_initialized {
            updated.profile_type = new_profile.profile_type.clone();
        }
        updated.profile_image = profile_image;
        updated.thumbnail_image = thumbnail_image;

        if new_profile.version == stored.version {
            if updated == stored {
                // Replayed update: one persisted change, second is a no-op.
                return Ok(conv_ok(conversation_response::Kind::UpdateProfile(
                    UpdateProfileResponse {},
                )));
            }
            return Ok(Reply::ok(Response::invalid_value("version")));
        }

        let now = self.ctx.now();
        let removable = {
            let mut conn = self.ctx.db.lock().await;
            let tx = conn.transaction().map_err(DbError::Sqlite)?;
            identities::update(&tx, &updated)?;
            let item = if was_initialized {
                homenet_sync::actions::change_item(&self.ctx.images, &updated)
            } else {
                homenet_sync::actions::add_item(&self.ctx.images, &updated)
            };
            homenet_sync::actions::enqueue_for_all_followers(&tx, &id, &item, now)?;
            tx.commit().map_err(DbError::Sqlite)?;

            // Superseded blobs go now unless another row still references
            // them (content addressing can share blobs across identities).
            let referenced: std::collections::HashSet<ImageHandle> =
                identities::all_image_handles(&conn)?.into_iter().collect();
            [stored.profile_image, stored.thumbnail_image]
                .into_iter()
                .flatten()
                .filter(|handle| !referenced.contains(handle))
                .collect::<Vec<_>>()
        };
        for handle in removable {
            if let Err(e) = self.ctx.images.remove(&handle).await {
                tracing::warn!(%handle, "superseded blob removal failed: {e}");
            }
        }

        self.invalidate_search_cache();
        self.ctx.actions_changed.notify_one();
        tracing::info!(identity = %id, version = %updated.version, "profile updated");
        Ok(conv_ok(conversation_response::Kind::UpdateProfile(
            UpdateProfileResponse {},
        )))
    }

    pub(crate) async fn handle_cancel_hosting(&mut self) -> Result<Reply> {
        let Some(id) = self.identity else {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        };
        let now = self.ctx.now();

        {
            let mut conn = self.ctx.db.lock().await;
            let stored = match identities::get_hosted(&conn, &id) {
                Ok(profile) => profile,
                Err(DbError::NotFound(_)) => return Ok(Reply::error(Status::ErrorNotFound)),
                Err(e) => return Err(e.into()),
            };
            if stored.expires_at.is_none() {
                let tx = conn.transaction().map_err(DbError::Sqlite)?;
                identities::set_expiration(&tx, &id, Some(now))?;
                if stored.version.is_initialized() {
                    let item = homenet_sync::actions::remove_item(&id);
                    homenet_sync::actions::enqueue_for_all_followers(&tx, &id, &item, now)?;
                }
                tx.commit().map_err(DbError::Sqlite)?;
            }
        }

        self.invalidate_search_cache();
        self.ctx.actions_changed.notify_one();
        tracing::info!(identity = %id, "hosting agreement cancelled");
        Ok(conv_ok(conversation_response::Kind::CancelHostingAgreement(
            CancelHostingAgreementResponse {},
        )))
    }

    pub(crate) async fn get_identity_information(
        &self,
        req: &GetIdentityInformationRequest,
    ) -> Result<Response> {
        let Ok(id) = IdentityId::from_slice(&req.identity_id) else {
            return Ok(Response::invalid_value("identityId"));
        };

        let profile = {
            let conn = self.ctx.db.lock().await;
            match identities::get_any(&conn, &id) {
                Ok(profile) => profile,
                Err(DbError::NotFound(_)) => return Ok(Response::error(Status::ErrorNotFound)),
                Err(e) => return Err(e.into()),
            }
        };

        let thumbnail = if req.include_thumbnail {
            match profile.thumbnail_image {
                Some(handle) => self.ctx.images.load(&handle).await.unwrap_or_default(),
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };
        let thumbnail_hash = if thumbnail.is_empty() {
            Vec::new()
        } else {
            sha256(&thumbnail).to_vec()
        };

        let is_hosted = profile.scope == ProfileScope::Hosted;
        let host_node_id = profile
            .host_node_id()
            .map(|n| n.as_bytes().to_vec())
            .unwrap_or_default();
        let info = ProfileInformation::from_profile(&profile, Vec::new(), thumbnail_hash);

        Ok(Response::ok(response::Kind::Single(SingleResponse {
            kind: Some(single_response::Kind::GetIdentityInformation(
                GetIdentityInformationResponse {
                    is_hosted,
                    host_node_id,
                    profile: Some(info),
                    thumbnail,
                },
            )),
        })))
    }

    async fn updated_image(
        &self,
        masked: bool,
        bytes: &[u8],
        declared_hash: &[u8],
        kind: ImageKind,
        current: Option<ImageHandle>,
    ) -> std::result::Result<Option<ImageHandle>, Response> {
        if !masked {
            return Ok(current);
        }
        if bytes.is_empty() {
            if !declared_hash.is_empty() {
                return Err(Response::invalid_value("image"));
            }
            return Ok(None);
        }
        if sha256(bytes).as_slice() != declared_hash {
            return Err(Response::invalid_value("image"));
        }
        match self.ctx.images.save(kind, bytes).await {
            Ok(handle) => Ok(Some(handle)),
            Err(ImageStoreError::TooLarge { .. }) => Err(Response::invalid_value("image")),
            Err(_) => Err(Response::error(Status::ErrorInternal)),
        }
    }

    pub(crate) fn invalidate_search_cache(&self) {
        if let Ok(mut cache) = self.ctx.search_cache.lock() {
            cache.clear();
        }
    }
}

/// Unmasked fields must match the stored row, otherwise the signed
/// profile would diverge from what we keep. The profile type is fixed at
/// first initialization.
fn check_field_consistency(
    req: &UpdateProfileRequest,
    info: &ProfileInformation,
    new_profile: &Profile,
    stored: &Profile,
) -> Option<Response> {
    let set = req.set_fields;
    let was_initialized = stored.version.is_initialized();

    if set & UPDATE_VERSION != 0 {
        if !new_profile.version.is_initialized() {
            return Some(Response::invalid_value("version"));
        }
        if new_profile.version < stored.version {
            return Some(Response::invalid_value("version"));
        }
    } else {
        if !was_initialized {
            // The first update must set the version.
            return Some(Response::invalid_value("setFields"));
        }
        if new_profile.version != stored.version {
            return Some(Response::invalid_value("version"));
        }
    }

    if set & UPDATE_NAME == 0 && info.name != stored.name {
        return Some(Response::invalid_value("name"));
    }
    if set & UPDATE_LOCATION == 0
        && was_initialized
        && (info.latitude_e7 != stored.location.latitude_e7()
            || info.longitude_e7 != stored.location.longitude_e7())
    {
        return Some(Response::invalid_value("location"));
    }
    if set & UPDATE_EXTRA_DATA == 0 && was_initialized && info.extra_data != stored.extra_data {
        return Some(Response::invalid_value("extraData"));
    }

    if was_initialized {
        if info.profile_type != stored.profile_type {
            return Some(Response::invalid_value("type"));
        }
    } else if info.profile_type.is_empty() {
        return Some(Response::invalid_value("type"));
    }
    None
}

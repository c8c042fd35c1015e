//! Profile search handlers: the two-stage filter and result paging.

use std::hash::{Hash, Hasher};

use homenet_db::queries::identities::{self, SearchFilter};
use homenet_proto::messages::{
    conversation_response, response, ConversationResponse, ProfileInformation,
    ProfileQueryInformation, ProfileSearchPartRequest, ProfileSearchPartResponse,
    ProfileSearchRequest, ProfileSearchResponse, Response, Status,
};
use homenet_search::{bounds_for, distance_m, GeoBounds, TextPredicate};
use homenet_types::{GpsLocation, Profile, ProfileScope};

use crate::conversation::{Conversation, Reply};
use crate::roles::Role;
use crate::Result;

fn conv_ok(kind: conversation_response::Kind) -> Reply {
    Reply::ok(Response::ok(response::Kind::Conversation(
        ConversationResponse { kind: Some(kind) },
    )))
}

/// Fingerprint of a search request, for the paging cache.
fn fingerprint(req: &ProfileSearchRequest) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    prost::Message::encode_to_vec(req).hash(&mut hasher);
    hasher.finish()
}

impl Conversation {
    pub(crate) async fn handle_profile_search(
        &mut self,
        req: &ProfileSearchRequest,
    ) -> Result<Reply> {
        let role_cap = match self.role {
            Role::ClientNonTls => self.ctx.limits.non_tls_search_cap,
            _ => self.ctx.limits.tls_search_cap,
        };

        let center = match (req.latitude_e7, req.longitude_e7) {
            (Some(lat), Some(lon)) => match GpsLocation::from_e7(lat, lon) {
                Ok(center) => Some(center),
                Err(_) => return Ok(Reply::ok(Response::invalid_value("location"))),
            },
            (None, None) => None,
            _ => return Ok(Reply::ok(Response::invalid_value("location"))),
        };
        if center.is_none() && req.radius_m > 0 {
            return Ok(Reply::ok(Response::invalid_value("radius")));
        }

        let max_total = if req.max_total_record_count == 0 {
            role_cap
        } else {
            req.max_total_record_count.min(role_cap)
        };
        let max_response = if req.max_response_record_count == 0 {
            max_total
        } else {
            req.max_response_record_count.min(max_total)
        };

        let bounds = match center {
            Some(center) => bounds_for(center, f64::from(req.radius_m)),
            None => GeoBounds::None,
        };
        // Stage 1 is deliberately uncapped: the bounding rectangle
        // over-selects, so the client's count limits apply to the refined
        // list, not to an arbitrary subset of the coarse candidates.
        let filter = SearchFilter {
            hosted_only: req.include_hosted_only,
            profile_type: TextPredicate::translate(&req.profile_type),
            name: TextPredicate::translate(&req.name),
            bounds,
            limit: None,
        };

        // Stage 1 in storage, stage 2 in memory.
        let candidates = {
            let conn = self.ctx.db.lock().await;
            identities::search(&conn, &filter)?
        };
        // Extra data is a plain substring filter, never pushed to storage.
        let extra_filter = if req.extra_data.is_empty() {
            None
        } else {
            Some(TextPredicate::Contains(req.extra_data.clone()))
        };
        let mut records = Vec::new();
        for profile in candidates {
            if let (Some(center), radius) = (center, f64::from(req.radius_m)) {
                if distance_m(center, profile.location) > radius {
                    continue;
                }
            }
            if let Some(pred) = &extra_filter {
                if !pred.matches(&profile.extra_data) {
                    continue;
                }
            }
            records.push(self.result_record(&profile, req.include_thumbnails).await);
            if records.len() >= max_total as usize {
                break;
            }
        }

        let total = records.len() as u32;
        let window: Vec<ProfileQueryInformation> = records
            .iter()
            .take(max_response as usize)
            .cloned()
            .collect();

        // Cache the full set for part requests.
        let key = (self.conn_id, fingerprint(req));
        self.last_search_key = Some(key);
        if let Ok(mut cache) = self.ctx.search_cache.lock() {
            cache.insert(key, records);
        }

        Ok(conv_ok(conversation_response::Kind::ProfileSearch(
            ProfileSearchResponse {
                total_record_count: total,
                max_response_record_count: max_response,
                profiles: window,
            },
        )))
    }

    pub(crate) fn handle_profile_search_part(
        &mut self,
        req: &ProfileSearchPartRequest,
    ) -> Result<Reply> {
        let Some(key) = self.last_search_key else {
            return Ok(Reply::error(Status::ErrorNotFound));
        };
        let cached = match self.ctx.search_cache.lock() {
            Ok(mut cache) => cache.get(&key),
            Err(_) => None,
        };
        let Some(records) = cached else {
            return Ok(Reply::error(Status::ErrorNotFound));
        };

        let start = req.record_index as usize;
        let count = req.record_count as usize;
        if start > records.len() || count == 0 {
            return Ok(Reply::ok(Response::invalid_value("recordIndex")));
        }
        let end = (start + count).min(records.len());

        Ok(conv_ok(conversation_response::Kind::ProfileSearchPart(
            ProfileSearchPartResponse {
                record_index: req.record_index,
                profiles: records[start..end].to_vec(),
            },
        )))
    }

    async fn result_record(
        &self,
        profile: &Profile,
        include_thumbnail: bool,
    ) -> ProfileQueryInformation {
        let thumbnail = if include_thumbnail {
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
            homenet_crypto::sha256(&thumbnail).to_vec()
        };

        ProfileQueryInformation {
            is_hosted: profile.scope == ProfileScope::Hosted,
            host_node_id: profile
                .host_node_id()
                .map(|n| n.as_bytes().to_vec())
                .unwrap_or_default(),
            profile: Some(ProfileInformation::from_profile(
                profile,
                Vec::new(),
                thumbnail_hash,
            )),
            thumbnail,
        }
    }
}

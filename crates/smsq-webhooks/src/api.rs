//! Operator boundary: campaigns, queue entries and conversation threads.
//!
//! Authentication lives in front of this service; callers pass the owner explicitly.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use smsq_core::{
    campaign::{Campaign, CampaignDraft},
    control::EnqueueRequest,
    domain::{new_id, CampaignId, OwnerId, PhoneNumber, QueueEntryId},
    message::MessageRecord,
    ports::CampaignStore,
    queue::QueueEntry,
};

use crate::{error::ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub owner: OwnerId,
}

#[derive(Debug, Deserialize)]
pub struct CreateCampaignBody {
    pub owner: OwnerId,
    pub campaign: CampaignDraft,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    pub owner: OwnerId,
    pub campaigns: Vec<EnqueueRequest>,
}

#[derive(Debug, Deserialize)]
pub struct ReplyBody {
    pub owner: OwnerId,
    pub text: String,
}

pub async fn create_campaign(
    State(state): State<AppState>,
    Json(body): Json<CreateCampaignBody>,
) -> ApiResult<(StatusCode, Json<Campaign>)> {
    let campaign = Campaign::from_draft(CampaignId(new_id()), body.owner, body.campaign)?;
    state.store.insert_campaign(campaign.clone()).await?;
    tracing::info!(campaign = %campaign.id, owner = %campaign.owner, name = %campaign.name, "campaign created");
    Ok((StatusCode::CREATED, Json(campaign)))
}

pub async fn enqueue(
    State(state): State<AppState>,
    Json(body): Json<EnqueueBody>,
) -> ApiResult<Json<Vec<QueueEntry>>> {
    let entries = state.control.enqueue(&body.owner, body.campaigns).await?;
    Ok(Json(entries))
}

pub async fn list_queue(
    State(state): State<AppState>,
    Query(q): Query<OwnerQuery>,
) -> ApiResult<Json<Vec<QueueEntry>>> {
    Ok(Json(state.control.list(&q.owner).await?))
}

pub async fn get_entry(
    State(state): State<AppState>,
    Path(id): Path<QueueEntryId>,
    Query(q): Query<OwnerQuery>,
) -> ApiResult<Json<QueueEntry>> {
    Ok(Json(state.control.get(&q.owner, &id).await?))
}

pub async fn pause(
    State(state): State<AppState>,
    Path(id): Path<QueueEntryId>,
    Query(q): Query<OwnerQuery>,
) -> ApiResult<Json<QueueEntry>> {
    Ok(Json(state.control.pause(&q.owner, &id).await?))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<QueueEntryId>,
    Query(q): Query<OwnerQuery>,
) -> ApiResult<Json<QueueEntry>> {
    Ok(Json(state.control.cancel(&q.owner, &id).await?))
}

pub async fn resume(
    State(state): State<AppState>,
    Path(id): Path<QueueEntryId>,
    Query(q): Query<OwnerQuery>,
) -> ApiResult<Json<QueueEntry>> {
    Ok(Json(state.control.resume(&q.owner, &id).await?))
}

pub async fn thread(
    State(state): State<AppState>,
    Path((campaign, phone)): Path<(CampaignId, PhoneNumber)>,
    Query(q): Query<OwnerQuery>,
) -> ApiResult<Json<Vec<MessageRecord>>> {
    Ok(Json(
        state.conversations.thread(&q.owner, &campaign, &phone).await?,
    ))
}

pub async fn reply(
    State(state): State<AppState>,
    Path((campaign, phone)): Path<(CampaignId, PhoneNumber)>,
    Json(body): Json<ReplyBody>,
) -> ApiResult<Json<MessageRecord>> {
    Ok(Json(
        state
            .conversations
            .reply(&body.owner, &campaign, &phone, &body.text)
            .await?,
    ))
}

use actix_web::{web, HttpResponse};
use log::error;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::auth::Identity;
use crate::chat_server::GetStats;
use crate::delivery::SendRequest;
use crate::error::ChatError;
use crate::models::{Attachment, MessageKind};
use crate::web_socket_server::ws_index;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageRequest {
    pub message: String,
    #[serde(default)]
    pub receiver_id: String,
    pub temp_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Deserialize)]
pub struct EditMessageRequest {
    pub message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub q: String,
    pub task_id: Option<String>,
}

#[derive(Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    pub unread: bool,
}

#[derive(Serialize)]
struct SeenResponse {
    seen: Vec<String>,
}

#[derive(Serialize)]
struct UpdatedResponse {
    updated: u64,
}

pub async fn list_messages(
    data: web::Data<AppState>,
    identity: Identity,
    task_id: web::Path<String>,
) -> Result<HttpResponse, ChatError> {
    let messages = data
        .delivery
        .list_by_room(&identity.tenant_id, &task_id)
        .await?;
    Ok(HttpResponse::Ok().json(messages))
}

pub async fn post_message(
    data: web::Data<AppState>,
    identity: Identity,
    task_id: web::Path<String>,
    body: web::Json<PostMessageRequest>,
) -> Result<HttpResponse, ChatError> {
    let body = body.into_inner();
    let message = data
        .delivery
        .send(SendRequest {
            tenant_id: identity.tenant_id,
            sender_id: identity.user_id,
            receiver_id: body.receiver_id,
            task_id: task_id.into_inner(),
            body: body.message,
            temp_id: body.temp_id,
            kind: body.kind,
            attachments: body.attachments,
        })
        .await?;
    Ok(HttpResponse::Created().json(message))
}

pub async fn mark_room_read(
    data: web::Data<AppState>,
    identity: Identity,
    task_id: web::Path<String>,
) -> Result<HttpResponse, ChatError> {
    let seen = data
        .delivery
        .mark_read(&identity.tenant_id, &task_id, &identity.user_id)
        .await?;
    Ok(HttpResponse::Ok().json(SeenResponse { seen }))
}

pub async fn search_messages(
    data: web::Data<AppState>,
    identity: Identity,
    query: web::Query<SearchQuery>,
) -> Result<HttpResponse, ChatError> {
    let hits = data
        .delivery
        .search(&identity.tenant_id, &query.q, query.task_id.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(hits))
}

pub async fn get_message(
    data: web::Data<AppState>,
    identity: Identity,
    message_id: web::Path<String>,
) -> Result<HttpResponse, ChatError> {
    let message = data.delivery.get(&identity.tenant_id, &message_id).await?;
    Ok(HttpResponse::Ok().json(message))
}

pub async fn edit_message(
    data: web::Data<AppState>,
    identity: Identity,
    message_id: web::Path<String>,
    body: web::Json<EditMessageRequest>,
) -> Result<HttpResponse, ChatError> {
    let message = data
        .delivery
        .edit(&identity.tenant_id, &identity.user_id, &message_id, &body.message)
        .await?;
    Ok(HttpResponse::Ok().json(message))
}

pub async fn delete_message(
    data: web::Data<AppState>,
    identity: Identity,
    message_id: web::Path<String>,
) -> Result<HttpResponse, ChatError> {
    data.delivery
        .delete(&identity.tenant_id, &identity.user_id, &message_id)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn list_notifications(
    data: web::Data<AppState>,
    identity: Identity,
    query: web::Query<NotificationQuery>,
) -> Result<HttpResponse, ChatError> {
    let rows = data
        .notifications
        .list(&identity.tenant_id, &identity.user_id, query.unread)
        .await?;
    Ok(HttpResponse::Ok().json(rows))
}

pub async fn mark_notification_read(
    data: web::Data<AppState>,
    identity: Identity,
    notification_id: web::Path<String>,
) -> Result<HttpResponse, ChatError> {
    // Users may only touch their own rows.
    let row = data
        .notifications
        .get(&identity.tenant_id, &notification_id)
        .await?;
    if row.recipient_id != identity.user_id {
        return Err(ChatError::NotFound);
    }
    data.notifications
        .mark_read(&identity.tenant_id, &notification_id)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn mark_all_notifications_read(
    data: web::Data<AppState>,
    identity: Identity,
) -> Result<HttpResponse, ChatError> {
    let updated = data
        .notifications
        .mark_all_read(&identity.tenant_id, &identity.user_id)
        .await?;
    Ok(HttpResponse::Ok().json(UpdatedResponse { updated }))
}

pub async fn chat_stats(
    data: web::Data<AppState>,
    identity: Identity,
) -> Result<HttpResponse, ChatError> {
    let stats = data
        .chat_server
        .send(GetStats {
            tenant_id: identity.tenant_id,
        })
        .await.map_err(|e| {
        error!("chat hub unreachable: {e}");
        ChatError::StorageUnavailable
    })?;
    Ok(HttpResponse::Ok().json(stats))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/tasks/{task_id}/messages")
            .route("", web::get().to(list_messages))
            .route("", web::post().to(post_message))
            .route("/read", web::post().to(mark_room_read)),
    )
    .service(
        web::scope("/messages")
            .route("/search", web::get().to(search_messages))
            .route("/{message_id}", web::get().to(get_message))
            .route("/{message_id}", web::put().to(edit_message))
            .route("/{message_id}", web::delete().to(delete_message)),
    )
    .service(
        web::scope("/notifications")
            .route("", web::get().to(list_notifications))
            .route("/read-all", web::post().to(mark_all_notifications_read))
            .route("/{notification_id}/read", web::post().to(mark_notification_read)),
    )
    .route("/chat/stats", web::get().to(chat_stats))
    .service(web::resource("/ws").route(web::get().to(ws_index)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use actix::Actor;
    use actix_web::{http::StatusCode, test, App};
    use chrono::Duration;
    use serde_json::{json, Value};

    use crate::app_state::Stores;
    use crate::auth::{issue_token, Authentication, Role, AUTH_ERROR_HEADER};
    use crate::chat_server::{ChatServer, Connect};
    use crate::clock::SystemClock;
    use crate::config::{ChatLimits, Config, StoreBackend};
    use crate::directory::StaticDirectory;
    use crate::models::ChatMessage;
    use crate::registry::tests::identity;

    const SECRET: &str = "route-secret";

    fn state() -> AppState {
        let config = Config {
            bind_addr: "127.0.0.1:0".into(),
            store: StoreBackend::Memory,
            database_name: "chat_db".into(),
            jwt_secret: SECRET.into(),
            frontend_origin: "http://localhost:3000".into(),
            limits: ChatLimits::default(),
        };
        let clock = Arc::new(SystemClock);
        let directory = Arc::new(
            StaticDirectory::new()
                .with_user("s", "t", "Sam", Role::Member)
                .with_user("r", "t", "Ria", Role::Member),
        );
        let stores = Stores::in_memory(clock.clone(), &config.limits, directory);
        AppState::new(config, ChatServer::new().start(), stores, clock)
    }

    fn bearer(user: &str) -> (&'static str, String) {
        let token = issue_token(user, "t", Role::Member, Duration::hours(1), SECRET).unwrap();
        ("Authorization", format!("Bearer {token}"))
    }

    macro_rules! app {
        ($state:expr) => {{
            let state = $state;
            test::init_service(
                App::new()
                    .wrap(Authentication::new(state.verifier.clone()))
                    .app_data(web::Data::new(state))
                    .configure(configure),
            )
            .await
        }};
    }

    #[actix_web::test]
    async fn post_then_list_a_room() {
        let app = app!(state());
        let req = test::TestRequest::post()
            .uri("/tasks/42/messages")
            .insert_header(bearer("s"))
            .set_json(json!({"message": "hello", "receiverId": "r"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created: ChatMessage = test::read_body_json(resp).await;
        assert_eq!(created.sender_name, "Sam");

        let req = test::TestRequest::get()
            .uri("/tasks/42/messages")
            .insert_header(bearer("r"))
            .to_request();
        let history: Vec<ChatMessage> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "hello");
        assert!(history[0].delivered && !history[0].read);

        let req = test::TestRequest::post()
            .uri("/tasks/42/messages/read")
            .insert_header(bearer("r"))
            .to_request();
        let seen: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(seen["seen"], json!([created.id]));

        let req = test::TestRequest::get()
            .uri("/notifications?unread=true")
            .insert_header(bearer("r"))
            .to_request();
        let inbox: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(inbox.as_array().map(Vec::len), Some(1));
        assert_eq!(inbox[0]["type"], "chat-message");
    }

    #[actix_web::test]
    async fn rejected_sends_carry_their_code() {
        let app = app!(state());
        let req = test::TestRequest::post()
            .uri("/tasks/42/messages")
            .insert_header(bearer("s"))
            .set_json(json!({"message": "   ", "receiverId": "r"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["code"], "EMPTY_MESSAGE");
    }

    #[actix_web::test]
    async fn missing_and_expired_tokens_are_told_apart() {
        let app = app!(state());
        let req = test::TestRequest::get().uri("/tasks/42/messages").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["code"], "TOKEN_MISSING");

        let stale = issue_token("s", "t", Role::Member, Duration::hours(-2), SECRET).unwrap();
        let req = test::TestRequest::get()
            .uri("/tasks/42/messages")
            .insert_header(("Authorization", format!("Bearer {stale}")))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers().get(AUTH_ERROR_HEADER).unwrap(), "TOKEN_EXPIRED");
    }

    #[actix_web::test]
    async fn websocket_handshake_without_a_token_is_refused() {
        let app = app!(state());
        let req = test::TestRequest::get().uri("/ws").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers().get(AUTH_ERROR_HEADER).unwrap(), "TOKEN_MISSING");
    }

    #[actix_web::test]
    async fn edits_by_others_are_forbidden() {
        let app = app!(state());
        let req = test::TestRequest::post()
            .uri("/tasks/42/messages")
            .insert_header(bearer("s"))
            .set_json(json!({"message": "helo", "receiverId": "r"}))
            .to_request();
        let created: ChatMessage = test::call_and_read_body_json(&app, req).await;

        let req = test::TestRequest::put()
            .uri(&format!("/messages/{}", created.id))
            .insert_header(bearer("r"))
            .set_json(json!({"message": "hijacked"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::delete()
            .uri(&format!("/messages/{}", created.id))
            .insert_header(bearer("s"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        // Still retrievable by id after the soft delete.
        let req = test::TestRequest::get()
            .uri(&format!("/messages/{}", created.id))
            .insert_header(bearer("s"))
            .to_request();
        let audit: ChatMessage = test::call_and_read_body_json(&app, req).await;
        assert!(audit.deleted);
    }

    #[actix_web::test]
    async fn search_is_scoped_to_the_callers_tenant() {
        let app = app!(state());
        for body in ["Deploy today", "lunch?"] {
            let req = test::TestRequest::post()
                .uri("/tasks/42/messages")
                .insert_header(bearer("s"))
                .set_json(json!({"message": body, "receiverId": "r"}))
                .to_request();
            test::call_service(&app, req).await;
        }
        let req = test::TestRequest::get()
            .uri("/messages/search?q=deploy&taskId=42")
            .insert_header(bearer("r"))
            .to_request();
        let hits: Vec<ChatMessage> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(hits.len(), 1);

        let outsider = issue_token("x", "elsewhere", Role::Member, Duration::hours(1), SECRET).unwrap();
        let req = test::TestRequest::get()
            .uri("/messages/search?q=deploy")
            .insert_header(("Authorization", format!("Bearer {outsider}")))
            .to_request();
        let hits: Vec<ChatMessage> = test::call_and_read_body_json(&app, req).await;
        assert!(hits.is_empty());
    }

    #[actix_web::test]
    async fn notifications_can_be_marked_read() {
        let app = app!(state());
        let req = test::TestRequest::post()
            .uri("/tasks/42/messages")
            .insert_header(bearer("s"))
            .set_json(json!({"message": "ping", "receiverId": "r"}))
            .to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::get()
            .uri("/notifications")
            .insert_header(bearer("r"))
            .to_request();
        let inbox: Value = test::call_and_read_body_json(&app, req).await;
        let id = inbox[0]["id"].as_str().unwrap().to_string();

        // Someone else's notification looks missing.
        let req = test::TestRequest::post()
            .uri(&format!("/notifications/{id}/read"))
            .insert_header(bearer("s"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post()
            .uri(&format!("/notifications/{id}/read"))
            .insert_header(bearer("r"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        let req = test::TestRequest::post()
            .uri("/notifications/read-all")
            .insert_header(bearer("r"))
            .to_request();
        let updated: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(updated["updated"], 0);
    }

    #[actix_web::test]
    async fn stats_report_the_hub() {
        let app = app!(state());
        let req = test::TestRequest::get()
            .uri("/chat/stats")
            .insert_header(bearer("s"))
            .to_request();
        let stats: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(stats, json!({"sessions": 0, "users": 0, "rooms": 0}));
    }

    #[actix_web::test]
    async fn stats_only_count_the_callers_tenant() {
        let state = state();
        let mut inboxes = Vec::new();
        for (user, tenant) in [("s", "t"), ("r", "t"), ("x", "other")] {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            inboxes.push(rx);
            state
                .chat_server
                .send(Connect {
                    identity: identity(user, tenant, Role::Member),
                    outbox: Box::new(tx),
                })
                .await
                .unwrap();
        }
        let app = app!(state);

        let token = issue_token("x", "other", Role::Member, Duration::hours(1), SECRET).unwrap();
        let req = test::TestRequest::get()
            .uri("/chat/stats")
            .insert_header(("Authorization", format!("Bearer {token}")))
            .to_request();
        let stats: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(stats, json!({"sessions": 1, "users": 1, "rooms": 1}));

        let req = test::TestRequest::get()
            .uri("/chat/stats")
            .insert_header(bearer("s"))
            .to_request();
        let stats: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(stats, json!({"sessions": 2, "users": 2, "rooms": 2}));
    }
}

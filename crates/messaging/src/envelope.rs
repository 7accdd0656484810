//! Message metadata, parsed once where a delivery enters the process.

use common::{AppId, MessageId, RequestScope};

use crate::broker::{MessageProperties, OutboundMessage};

pub const AUTHORIZED_USER_ID_HEADER: &str = "x-authorized-user-id";
pub const AUTHORIZED_USER_ROLES_HEADER: &str = "x-authorized-user-roles";
pub const FROM_APP_ID_HEADER: &str = "x-from-app-id";

/// Typed metadata of one delivery, lent to the handler for a single invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: Option<String>,
    /// Never empty: generated when the publisher did not set one.
    pub correlation_id: String,
    /// Application that published the message.
    pub publisher_app_id: Option<AppId>,
    /// Application the publisher was acting for, when it relayed a request.
    pub from_app_id: Option<AppId>,
    pub authorized_user_id: Option<String>,
    pub authorized_user_roles: Vec<String>,
    pub content_type: Option<String>,
    pub redelivered: bool,
}

impl Envelope {
    pub fn from_properties(properties: &MessageProperties, redelivered: bool) -> Self {
        let correlation_id = properties
            .correlation_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| MessageId::new().to_string());

        Self {
            message_id: properties.message_id.clone(),
            correlation_id,
            publisher_app_id: non_empty(properties.app_id.as_deref()).map(AppId::from),
            from_app_id: properties.header(FROM_APP_ID_HEADER).map(AppId::from),
            authorized_user_id: properties.header(AUTHORIZED_USER_ID_HEADER).map(str::to_string),
            authorized_user_roles: properties
                .header(AUTHORIZED_USER_ROLES_HEADER)
                .map(split_roles)
                .unwrap_or_default(),
            content_type: non_empty(properties.content_type.as_deref()).map(str::to_string),
            redelivered,
        }
    }

    /// Builds the scope a handler in `app_id` runs under. The publisher of the
    /// message becomes the scope's from-app.
    pub fn request_scope(&self, app_id: &AppId) -> RequestScope {
        let mut scope = RequestScope::new(app_id.clone(), self.correlation_id.clone());
        if let Some(publisher) = &self.publisher_app_id {
            scope = scope.with_from_app(publisher.clone());
        }
        if let Some(user_id) = &self.authorized_user_id {
            scope = scope.with_user(user_id.clone(), self.authorized_user_roles.iter().cloned());
        }
        scope
    }
}

/// Builds an outgoing persistent message from the application `app_id`,
/// stamped with a new message id and the correlation and identity carried
/// by `scope`.
pub fn outbound_message(
    app_id: &AppId,
    scope: &RequestScope,
    payload: Vec<u8>,
    content_type: &str,
) -> OutboundMessage {
    let mut properties = MessageProperties {
        message_id: Some(MessageId::new().to_string()),
        correlation_id: Some(scope.correlation_id().to_string()),
        app_id: Some(app_id.to_string()),
        content_type: non_empty(Some(content_type)).map(str::to_string),
        persistent: true,
        ..Default::default()
    };

    if let Some(from_app_id) = scope.from_app_id() {
        properties
            .headers
            .insert(FROM_APP_ID_HEADER.to_string(), from_app_id.to_string());
    }
    if let Some(user_id) = scope.authorized_user_id() {
        properties
            .headers
            .insert(AUTHORIZED_USER_ID_HEADER.to_string(), user_id.to_string());
        properties
            .headers
            .insert(AUTHORIZED_USER_ROLES_HEADER.to_string(), scope.joined_roles());
    }

    OutboundMessage {
        properties,
        body: payload,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}

fn split_roles(roles: &str) -> Vec<String> {
    roles
        .split(',')
        .map(str::trim)
        .filter(|role| !role.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_correlation_id_is_generated() {
        let envelope = Envelope::from_properties(&MessageProperties::default(), false);
        assert!(!envelope.correlation_id.is_empty());

        let empty = MessageProperties {
            correlation_id: Some(String::new()),
            ..Default::default()
        };
        let other = Envelope::from_properties(&empty, false);
        assert!(!other.correlation_id.is_empty());
        assert_ne!(envelope.correlation_id, other.correlation_id);
    }

    #[test]
    fn parses_identity_headers() {
        let mut properties = MessageProperties {
            correlation_id: Some("corr-7".to_string()),
            app_id: Some("accounts".to_string()),
            content_type: Some("application/json".to_string()),
            ..Default::default()
        };
        properties
            .headers
            .insert(AUTHORIZED_USER_ID_HEADER.to_string(), "user-1".to_string());
        properties
            .headers
            .insert(AUTHORIZED_USER_ROLES_HEADER.to_string(), "admin, ops,".to_string());
        properties
            .headers
            .insert(FROM_APP_ID_HEADER.to_string(), "gateway".to_string());

        let envelope = Envelope::from_properties(&properties, true);

        assert_eq!(envelope.correlation_id, "corr-7");
        assert_eq!(envelope.publisher_app_id, Some(AppId::from("accounts")));
        assert_eq!(envelope.from_app_id, Some(AppId::from("gateway")));
        assert_eq!(envelope.authorized_user_id.as_deref(), Some("user-1"));
        assert_eq!(envelope.authorized_user_roles, vec!["admin", "ops"]);
        assert_eq!(envelope.content_type.as_deref(), Some("application/json"));
        assert!(envelope.redelivered);
    }

    #[test]
    fn request_scope_records_publisher_as_from_app() {
        let properties = MessageProperties {
            correlation_id: Some("corr-7".to_string()),
            app_id: Some("accounts".to_string()),
            ..Default::default()
        };
        let envelope = Envelope::from_properties(&properties, false);

        let scope = envelope.request_scope(&AppId::from("billing"));

        assert_eq!(scope.correlation_id(), "corr-7");
        assert_eq!(scope.app_id(), &AppId::from("billing"));
        assert_eq!(scope.from_app_id(), Some(&AppId::from("accounts")));
        assert_eq!(scope.authorized_user_id(), None);
    }

    #[test]
    fn outbound_message_carries_scope() {
        let scope = RequestScope::new("billing", "corr-9")
            .with_from_app("accounts")
            .with_user("user-1", ["admin", "ops"]);

        let message = outbound_message(&AppId::from("billing"), &scope, b"{}".to_vec(), "application/json");
        let properties = &message.properties;

        assert!(properties.message_id.is_some());
        assert!(properties.persistent);
        assert_eq!(properties.correlation_id.as_deref(), Some("corr-9"));
        assert_eq!(properties.app_id.as_deref(), Some("billing"));
        assert_eq!(properties.header(FROM_APP_ID_HEADER), Some("accounts"));
        assert_eq!(properties.header(AUTHORIZED_USER_ID_HEADER), Some("user-1"));
        assert_eq!(properties.header(AUTHORIZED_USER_ROLES_HEADER), Some("admin,ops"));
    }

    #[test]
    fn anonymous_scope_sets_no_user_headers() {
        let scope = RequestScope::for_app("billing");
        let message = outbound_message(&AppId::from("billing"), &scope, Vec::new(), "");

        assert!(message.properties.headers.is_empty());
        assert_eq!(message.properties.content_type, None);
        assert!(!scope.correlation_id().is_empty());
    }
}

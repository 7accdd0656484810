//! Request-scoped identity carried from a message or HTTP boundary into handlers.

use uuid::Uuid;

use crate::AppId;

/// Immutable request scope.
///
/// Built once where a request enters the process (a broker delivery or an HTTP
/// request) and passed by reference to handlers, the saga coordinator and the
/// publisher, which stamps it into outgoing message metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestScope {
    correlation_id: String,
    app_id: AppId,
    from_app_id: Option<AppId>,
    authorized_user_id: Option<String>,
    authorized_user_roles: Vec<String>,
}

impl RequestScope {
    /// Creates a scope for `app_id` with an explicit correlation id.
    ///
    /// An empty correlation id is replaced by a freshly generated one.
    pub fn new(app_id: impl Into<AppId>, correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        let correlation_id = if correlation_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            correlation_id
        };

        Self {
            correlation_id,
            app_id: app_id.into(),
            from_app_id: None,
            authorized_user_id: None,
            authorized_user_roles: Vec::new(),
        }
    }

    /// Creates a scope for `app_id` starting a new correlation chain.
    pub fn for_app(app_id: impl Into<AppId>) -> Self {
        Self::new(app_id, String::new())
    }

    /// Records the application the request came from.
    pub fn with_from_app(mut self, from_app_id: impl Into<AppId>) -> Self {
        self.from_app_id = Some(from_app_id.into());
        self
    }

    /// Records the authorized user and their roles.
    pub fn with_user<I, R>(mut self, user_id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        let user_id = user_id.into();
        self.authorized_user_id = (!user_id.is_empty()).then_some(user_id);
        self.authorized_user_roles = roles
            .into_iter()
            .map(Into::into)
            .filter(|role: &String| !role.is_empty())
            .collect();
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    pub fn from_app_id(&self) -> Option<&AppId> {
        self.from_app_id.as_ref()
    }

    pub fn authorized_user_id(&self) -> Option<&str> {
        self.authorized_user_id.as_deref()
    }

    pub fn authorized_user_roles(&self) -> &[String] {
        &self.authorized_user_roles
    }

    /// Roles joined with commas, the form carried in message headers.
    pub fn joined_roles(&self) -> String {
        self.authorized_user_roles.join(",")
    }
}

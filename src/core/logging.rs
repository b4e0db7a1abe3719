//! Request-scoped logging context.
//!
//! Task-local storage lets log lines and metrics include the request id,
//! the authenticated identity, and the provider that ultimately served the
//! request without threading those values through every call.

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

tokio::task_local! {
    /// Task-local storage for the authenticated identity handling this request.
    pub static IDENTITY_CONTEXT: String;
}

tokio::task_local! {
    /// Task-local storage for the provider serving the current request.
    pub static PROVIDER_CONTEXT: String;
}

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Get the current identity from context, if set.
///
/// Returns "anonymous" if no identity is set.
pub fn get_identity_context() -> String {
    IDENTITY_CONTEXT
        .try_with(|id| id.clone())
        .unwrap_or_else(|_| "anonymous".to_string())
}

/// Get the current provider name from context, if set.
///
/// Returns an empty string if no provider context is set.
pub fn get_provider_context() -> String {
    PROVIDER_CONTEXT
        .try_with(|ctx| ctx.clone())
        .unwrap_or_default()
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Execute an async block with request context (request_id, identity).
///
/// This macro simplifies the nested scope pattern used in handlers.
///
/// # Example
///
/// ```ignore
/// with_request_context!(request_id, identity, async {
///     // handler logic here
/// })
/// ```
#[macro_export]
macro_rules! with_request_context {
    ($request_id:expr, $identity:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID
            .scope($request_id, async {
                $crate::core::logging::IDENTITY_CONTEXT
                    .scope($identity, $body)
                    .await
            })
            .await
    };
}

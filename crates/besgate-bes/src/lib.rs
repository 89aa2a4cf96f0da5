//! Request descriptors, result types and the client trait for the Backend
//! Execution Service.
//!
//! The BES is treated as an opaque synchronous RPC target: one request
//! document goes out, one response (or one error document) comes back. The
//! gateway never interprets response payloads beyond telling success from
//! error.
//!
//! This crate is deliberately a leaf: it carries no I/O and no configuration,
//! so test helpers can implement [`BesClient`] without depending on the
//! service layer.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

/// Escapes the XML-significant characters in `text` for interpolation into
/// element text or attribute values.
pub fn xml_escape(text: &str) -> Cow<'_, str> {
    if !text.contains(['&', '<', '>', '"']) {
        return Cow::Borrowed(text);
    }
    let mut escaped = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }
    Cow::Owned(escaped)
}

/// The operation a [`BesCommand`] asks the BES to perform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BesOperation {
    /// Catalog listing for a node (directory or dataset).
    ShowNode,
    /// DAP2 data access with an optional combined constraint expression.
    Dap2Data {
        /// The DAP2 constraint expression, if any.
        constraint: Option<String>,
    },
    /// DAP4 data access carrying separate projection and selection clauses.
    ///
    /// The immediate execution path only understands DAP2, so this form is
    /// collapsed into [`BesOperation::Dap2Data`] right before execution.
    Dap4Data {
        /// The DAP4 projection clause (`proj` parameter).
        projection: Option<String>,
        /// The DAP4 selection clauses (repeated `sel` parameters).
        selections: Vec<String>,
    },
}

/// A request descriptor for one BES transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BesCommand {
    /// The catalog path or dataset the transaction addresses.
    pub resource: String,
    /// What the BES is asked to do.
    pub operation: BesOperation,
    /// Per-call time budget, forwarded as the `bes_timeout` context.
    pub timeout: Option<Duration>,
}

impl BesCommand {
    /// A catalog listing command for `resource`.
    pub fn show_node(resource: impl Into<String>) -> Self {
        BesCommand {
            resource: resource.into(),
            operation: BesOperation::ShowNode,
            timeout: None,
        }
    }

    /// Attaches a per-call timeout budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Renders the command as a BES request document.
    pub fn render(&self, req_id: &str) -> String {
        self.render_with_limit(req_id, None)
    }

    /// Renders the command, additionally asking the BES to cap its response
    /// at `max_response_size` bytes (`Some(0)` means unlimited, like `None`).
    pub fn render_with_limit(&self, req_id: &str, max_response_size: Option<u64>) -> String {
        let resource = xml_escape(&self.resource);
        let mut doc = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        doc.push_str(&format!("<request reqID=\"{}\">\n", xml_escape(req_id)));
        if let Some(timeout) = self.timeout {
            doc.push_str(&format!(
                "  <setContext name=\"bes_timeout\">{}</setContext>\n",
                timeout.as_secs()
            ));
        }
        if let Some(limit) = max_response_size.filter(|limit| *limit > 0) {
            doc.push_str(&format!(
                "  <setContext name=\"max_response_size\">{limit}</setContext>\n",
            ));
        }
        doc.push_str("  <setContext name=\"errors\">xml</setContext>\n");
        match &self.operation {
            BesOperation::ShowNode => {
                doc.push_str(&format!("  <showNode node=\"{resource}\"/>\n"));
            }
            BesOperation::Dap2Data { constraint } => {
                doc.push_str(&format!(
                    "  <setContainer name=\"c\" space=\"catalog\">{resource}</setContainer>\n",
                ));
                doc.push_str("  <define name=\"d\">\n    <container name=\"c\">");
                if let Some(ce) = constraint {
                    doc.push_str(&format!("<constraint>{}</constraint>", xml_escape(ce)));
                }
                doc.push_str("</container>\n  </define>\n");
                doc.push_str("  <get type=\"dods\" definition=\"d\"/>\n");
            }
            BesOperation::Dap4Data { .. } => {
                // Callers collapse DAP4 commands to DAP2 before execution;
                // render the resource access without a constraint so a stray
                // descriptor still produces a well-formed document.
                doc.push_str(&format!(
                    "  <setContainer name=\"c\" space=\"catalog\">{resource}</setContainer>\n",
                ));
                doc.push_str("  <define name=\"d\">\n    <container name=\"c\"/>\n  </define>\n");
                doc.push_str("  <get type=\"dap\" definition=\"d\"/>\n");
            }
        }
        doc.push_str("</request>\n");
        doc
    }
}

/// An immutable snapshot of a [`BesCommand`] suitable for caching.
///
/// Constructed once at cache-insertion time. The per-call timeout is stripped
/// because a cached descriptor may be replayed later (by the refresh task)
/// under a different timeout policy, and the snapshot is never mutated after
/// construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSnapshot(BesCommand);

impl CommandSnapshot {
    /// Snapshots `command`, dropping transient per-call fields.
    pub fn of(command: &BesCommand) -> Self {
        let mut command = command.clone();
        command.timeout = None;
        CommandSnapshot(command)
    }

    /// The stored descriptor.
    pub fn command(&self) -> &BesCommand {
        &self.0
    }
}

/// A successful BES response payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BesPayload(pub String);

impl BesPayload {
    /// The response document text.
    pub fn text(&self) -> &str {
        &self.0
    }
}

/// Errors reported by, or while talking to, the BES.
///
/// The numeric codes mirror the BES error taxonomy (1 internal, 2 internal
/// fatal, 3 user syntax, 4 forbidden, 5 not found, 6 timeout).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BesError {
    /// The BES reported an internal error (code 1).
    #[error("BES internal error: {0}")]
    Internal(String),
    /// The BES reported a fatal internal error (code 2).
    #[error("fatal BES internal error: {0}")]
    InternalFatal(String),
    /// The request document was syntactically unacceptable (code 3).
    #[error("bad request syntax: {0}")]
    Syntax(String),
    /// Access to the resource is forbidden (code 4).
    #[error("access forbidden: {0}")]
    Forbidden(String),
    /// The resource does not exist (code 5).
    #[error("resource not found: {0}")]
    NotFound(String),
    /// The transaction exceeded its time budget (code 6).
    #[error("BES transaction timed out: {0}")]
    Timeout(String),
    /// The exchange with the BES violated the wire protocol. Indicates a
    /// programming or deployment bug, not a transient condition.
    #[error("PPT protocol error: {0}")]
    Protocol(String),
    /// The connection to the BES could not be established or was lost.
    #[error("connection to BES failed: {0}")]
    Connection(String),
}

impl BesError {
    /// Whether this error must halt long-running maintenance work (the cache
    /// refresh loop) instead of being recorded and retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BesError::InternalFatal(_) | BesError::Protocol(_))
    }

    /// Builds a [`BesError`] from a `<BESError>` document.
    ///
    /// Unparseable documents degrade to [`BesError::Protocol`], since a BES
    /// that emits garbage on its error channel cannot be trusted.
    pub fn from_error_document(doc: &str) -> Self {
        static TYPE_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"<Type>\s*(\d+)\s*</Type>").unwrap());
        static MESSAGE_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?s)<Message>\s*(.*?)\s*</Message>").unwrap());

        let message = MESSAGE_RE
            .captures(doc)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_owned())
            .unwrap_or_else(|| "no message in BESError document".to_owned());

        let code = TYPE_RE
            .captures(doc)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok());

        match code {
            Some(1) => BesError::Internal(message),
            Some(2) => BesError::InternalFatal(message),
            Some(3) => BesError::Syntax(message),
            Some(4) => BesError::Forbidden(message),
            Some(5) => BesError::NotFound(message),
            Some(6) => BesError::Timeout(message),
            _ => BesError::Protocol(format!("unrecognized BESError document: {message}")),
        }
    }
}

/// The stored outcome of one executed BES transaction.
///
/// Backend errors are first-class cached values: replaying a failing request
/// immediately would only hammer a struggling BES, so the error is kept until
/// the refresh task observes a different outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// The BES produced a response document.
    Success(BesPayload),
    /// The BES reported an error for this transaction.
    BackendError(BesError),
}

impl fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionOutcome::Success(payload) => {
                write!(f, "success ({} bytes)", payload.text().len())
            }
            TransactionOutcome::BackendError(err) => write!(f, "backend error ({err})"),
        }
    }
}

/// The opaque I/O boundary to the BES.
///
/// Everything above this trait treats a transaction as "descriptor in,
/// payload or error out"; the wire format lives entirely behind it.
#[async_trait]
pub trait BesClient: Send + Sync {
    /// Executes one transaction against the BES.
    async fn transaction(&self, command: &BesCommand) -> Result<BesPayload, BesError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_strips_timeout() {
        let command =
            BesCommand::show_node("/data/nc/fnoc1.nc").with_timeout(Duration::from_secs(300));
        let snapshot = CommandSnapshot::of(&command);
        assert_eq!(snapshot.command().timeout, None);
        assert_eq!(snapshot.command().resource, "/data/nc/fnoc1.nc");
        // The original descriptor is untouched.
        assert_eq!(command.timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_xml_escape() {
        assert!(matches!(xml_escape("plain text"), Cow::Borrowed(_)));
        assert_eq!(xml_escape("u<3&v>1"), "u&lt;3&amp;v&gt;1");
        assert_eq!(xml_escape(r#"say "hi""#), "say &quot;hi&quot;");
    }

    #[test]
    fn test_render_show_node() {
        let doc = BesCommand::show_node("/data").render("req-1");
        assert!(doc.contains("<showNode node=\"/data\"/>"));
        assert!(doc.contains("reqID=\"req-1\""));
        assert!(!doc.contains("bes_timeout"));
    }

    #[test]
    fn test_render_escapes_markup() {
        let command = BesCommand {
            resource: "/data/a&b.nc".to_owned(),
            operation: BesOperation::Dap2Data {
                constraint: Some("u<3&v>1".to_owned()),
            },
            timeout: None,
        };
        let doc = command.render("req-1");
        assert!(doc.contains("<constraint>u&lt;3&amp;v&gt;1</constraint>"));
        assert!(doc.contains("space=\"catalog\">/data/a&amp;b.nc</setContainer>"));
        assert!(!doc.contains("u<3"));
    }

    #[test]
    fn test_render_timeout_context() {
        let doc = BesCommand::show_node("/data")
            .with_timeout(Duration::from_secs(60))
            .render("req-2");
        assert!(doc.contains("<setContext name=\"bes_timeout\">60</setContext>"));
    }

    #[test]
    fn test_render_response_size_limit() {
        let command = BesCommand::show_node("/data");
        let doc = command.render_with_limit("req-3", Some(1048576));
        assert!(doc.contains("<setContext name=\"max_response_size\">1048576</setContext>"));
        // Zero means unlimited and emits no context at all.
        let doc = command.render_with_limit("req-3", Some(0));
        assert!(!doc.contains("max_response_size"));
    }

    #[test]
    fn test_error_document_codes() {
        let doc = "<BESError><Type>5</Type><Message>No such node</Message></BESError>";
        assert_eq!(
            BesError::from_error_document(doc),
            BesError::NotFound("No such node".to_owned())
        );

        let doc = "<BESError><Type>2</Type><Message>backend store corrupt</Message></BESError>";
        let err = BesError::from_error_document(doc);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_garbage_error_document() {
        let err = BesError::from_error_document("not xml at all");
        assert!(matches!(err, BesError::Protocol(_)));
        assert!(err.is_fatal());
    }
}

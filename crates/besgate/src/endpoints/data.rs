use axum::extract::{Host, Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};

use besgate_service::bes::{BesCommand, BesOperation, xml_escape};
use besgate_service::deferred::{DeferredOutcome, DelaySignals, RejectionReason};

use super::ResponseError;
use crate::service::GatewayService;

/// The request header equivalent of the `async` query parameter.
const ASYNC_ACCEPT_HEADER: &str = "x-dap-async-accept";

/// Serves a DAP4 data request, negotiating deferred fulfillment.
///
/// The client states the delay it accepts through the `async` query parameter
/// or the `X-DAP-Async-Accept` header (seconds; the query parameter wins).
/// Depending on tracker state the response is one of the asynchronous
/// protocol documents or, once the result is due, the data itself.
pub async fn handle_data_request(
    State(service): State<GatewayService>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    Host(host): Host,
    headers: HeaderMap,
) -> Result<Response, ResponseError> {
    let scope = service.open_scope();
    let resource = service.resolve_resource(scope.id(), &path)?;

    let query = query.unwrap_or_default();
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    let signals = DelaySignals {
        query: first_value(&pairs, "async"),
        header: headers
            .get(ASYNC_ACCEPT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
    };

    let command = BesCommand {
        resource: resource.to_string(),
        operation: BesOperation::Dap4Data {
            projection: first_value(&pairs, "proj"),
            selections: pairs
                .iter()
                .filter(|(k, _)| k == "sel")
                .map(|(_, v)| v.clone())
                .collect(),
        },
        timeout: Some(service.config().bes.timeout),
    };

    // The tracker key identifies "this resource with these parameters"; the
    // delay-acceptance parameter is not part of the identity, so polls with a
    // different `async` value still find the entry.
    let resource_key = canonical_key(&resource, &pairs);
    let poll_link = poll_link(&host, &path, &query, &signals);
    tracing::debug!(key = %resource_key, "data request");

    let outcome = service
        .data_request(&resource_key, &command, &signals, &poll_link)
        .await?;
    Ok(render_outcome(outcome))
}

fn first_value(pairs: &[(String, String)], key: &str) -> Option<String> {
    pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

/// The canonical identity of a data request: path plus all query parameters
/// except the delay signal, in their original order.
fn canonical_key(resource: &str, pairs: &[(String, String)]) -> String {
    let mut key = resource.to_owned();
    let mut first = true;
    for (k, v) in pairs {
        if k == "async" {
            continue;
        }
        key.push(if first { '?' } else { '&' });
        first = false;
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key
}

/// The URL the client polls for the result.
///
/// When the delay signal arrived only in a header it is folded into the
/// link's query string, so the poll succeeds even from a client that drops
/// custom headers between redirects.
fn poll_link(host: &str, path: &str, query: &str, signals: &DelaySignals) -> String {
    let mut link = format!("http://{host}/data/{path}");
    match (&signals.query, &signals.header) {
        (None, Some(accepted)) if !query.is_empty() => {
            link.push_str(&format!("?async={accepted}&{query}"));
        }
        (None, Some(accepted)) => link.push_str(&format!("?async={accepted}")),
        _ if !query.is_empty() => link.push_str(&format!("?{query}")),
        _ => {}
    }
    link
}

fn render_outcome(outcome: DeferredOutcome) -> Response {
    let status = StatusCode::from_u16(outcome.http_status_hint())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match outcome {
        DeferredOutcome::Required {
            expected_delay,
            result_lifetime,
        } => (
            status,
            [
                ("x-dap-async-required", String::new()),
                (header::CONTENT_TYPE.as_str(), "text/xml".to_owned()),
            ],
            async_doc(
                "required",
                &[
                    ("expectedDelay", expected_delay.as_secs().to_string()),
                    ("responseLifetime", result_lifetime.as_secs().to_string()),
                ],
                None,
            ),
        )
            .into_response(),
        DeferredOutcome::Rejected {
            reason,
            description,
        } => {
            let reason = match reason {
                RejectionReason::Time => "time",
            };
            (
                status,
                [(header::CONTENT_TYPE, "text/xml")],
                async_doc(
                    "rejected",
                    &[("reasonCode", reason.to_owned())],
                    Some(&description),
                ),
            )
                .into_response()
        }
        DeferredOutcome::Accepted {
            poll_link,
            expected_delay,
            result_lifetime,
        } => (
            status,
            [
                (
                    "x-dap-async-accepted",
                    expected_delay.as_secs().to_string(),
                ),
                (header::CONTENT_TYPE.as_str(), "text/xml".to_owned()),
            ],
            async_doc(
                "accepted",
                &[
                    ("expectedDelay", expected_delay.as_secs().to_string()),
                    ("responseLifetime", result_lifetime.as_secs().to_string()),
                    ("link", poll_link),
                ],
                None,
            ),
        )
            .into_response(),
        DeferredOutcome::Pending => (
            status,
            [(header::CONTENT_TYPE, "text/xml")],
            async_doc("pending", &[], None),
        )
            .into_response(),
        DeferredOutcome::Ready(payload) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            payload.0,
        )
            .into_response(),
        DeferredOutcome::Gone => (
            status,
            [(header::CONTENT_TYPE, "text/xml")],
            async_doc("gone", &[], None),
        )
            .into_response(),
        DeferredOutcome::Unavailable => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Renders one of the asynchronous-response protocol documents.
///
/// Field values and the description carry client-supplied text (most notably
/// the poll link's query string) and are escaped for XML.
fn async_doc(status: &str, fields: &[(&str, String)], description: Option<&str>) -> String {
    let mut doc = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    doc.push_str(&format!("<AsynchronousResponse status=\"{status}\">\n"));
    for (name, value) in fields {
        let value = xml_escape(value);
        if *name == "link" {
            doc.push_str(&format!("  <link href=\"{value}\"/>\n"));
        } else {
            doc.push_str(&format!("  <{name} seconds=\"{value}\"/>\n"));
        }
    }
    if let Some(description) = description {
        doc.push_str(&format!(
            "  <description>{}</description>\n",
            xml_escape(description)
        ));
    }
    doc.push_str("</AsynchronousResponse>\n");
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &str) -> Vec<(String, String)> {
        url::form_urlencoded::parse(raw.as_bytes())
            .into_owned()
            .collect()
    }

    #[test]
    fn test_canonical_key_excludes_async() {
        let key = canonical_key("/data/sst.nc", &pairs("proj=sst&async=60&sel=time>5"));
        assert_eq!(key, "/data/sst.nc?proj=sst&sel=time>5");
    }

    #[test]
    fn test_canonical_key_without_query() {
        assert_eq!(canonical_key("/data/sst.nc", &pairs("async=60")), "/data/sst.nc");
    }

    #[test]
    fn test_poll_link_folds_header_signal_into_query() {
        let signals = DelaySignals {
            query: None,
            header: Some("60".to_owned()),
        };
        let link = poll_link("localhost:3017", "sst.nc", "proj=sst", &signals);
        assert_eq!(link, "http://localhost:3017/data/sst.nc?async=60&proj=sst");
    }

    #[test]
    fn test_poll_link_keeps_query_signal() {
        let signals = DelaySignals {
            query: Some("60".to_owned()),
            header: None,
        };
        let link = poll_link("localhost:3017", "sst.nc", "async=60&proj=sst", &signals);
        assert_eq!(link, "http://localhost:3017/data/sst.nc?async=60&proj=sst");
    }

    #[test]
    fn test_async_doc_rendering() {
        let doc = async_doc(
            "accepted",
            &[
                ("expectedDelay", "60".to_owned()),
                ("link", "http://example/poll".to_owned()),
            ],
            None,
        );
        assert!(doc.contains("<AsynchronousResponse status=\"accepted\">"));
        assert!(doc.contains("<expectedDelay seconds=\"60\"/>"));
        assert!(doc.contains("<link href=\"http://example/poll\"/>"));
    }

    #[test]
    fn test_async_doc_escapes_client_text() {
        let doc = async_doc(
            "accepted",
            &[(
                "link",
                "http://localhost:3017/data/sst.nc?async=60&proj=sst".to_owned(),
            )],
            None,
        );
        assert!(doc.contains("href=\"http://localhost:3017/data/sst.nc?async=60&amp;proj=sst\""));

        let doc = async_doc("rejected", &[], Some("delay < 60s & too short"));
        assert!(doc.contains("<description>delay &lt; 60s &amp; too short</description>"));
    }
}

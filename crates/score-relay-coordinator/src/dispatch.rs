use std::collections::BTreeSet;
use std::io::Write;

use anyhow::{bail, Context, Result};
use score_relay_core::OutboundMessage;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// One outbound message addressed to a named endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dispatch {
    pub message_id: Ulid,
    pub endpoint: String,
    pub message: OutboundMessage,
}

impl Dispatch {
    #[must_use]
    pub fn new(endpoint: &str, message: OutboundMessage) -> Self {
        Self {
            message_id: Ulid::new(),
            endpoint: endpoint.to_string(),
            message,
        }
    }
}

/// Fire-and-forget delivery to the messaging substrate.
///
/// An `Err` means the substrate refused the message synchronously. Delivery
/// after acceptance is not observable here.
pub trait Dispatcher {
    #[allow(clippy::missing_errors_doc)]
    fn dispatch(&mut self, dispatch: &Dispatch) -> Result<()>;
}

/// Keeps every accepted dispatch in memory. Endpoints marked unavailable
/// refuse delivery.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    sent: Vec<Dispatch>,
    unavailable: BTreeSet<String>,
}

impl RecordingDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&mut self, endpoint: &str, unavailable: bool) {
        if unavailable {
            self.unavailable.insert(endpoint.to_string());
        } else {
            self.unavailable.remove(endpoint);
        }
    }

    #[must_use]
    pub fn sent(&self) -> &[Dispatch] {
        &self.sent
    }

    pub fn sent_to<'a>(&'a self, endpoint: &'a str) -> impl Iterator<Item = &'a Dispatch> + 'a {
        self.sent
            .iter()
            .filter(move |dispatch| dispatch.endpoint == endpoint)
    }

    pub fn take(&mut self) -> Vec<Dispatch> {
        std::mem::take(&mut self.sent)
    }
}

impl Dispatcher for RecordingDispatcher {
    fn dispatch(&mut self, dispatch: &Dispatch) -> Result<()> {
        if self.unavailable.contains(&dispatch.endpoint) {
            bail!("endpoint {} is unavailable", dispatch.endpoint);
        }
        self.sent.push(dispatch.clone());
        Ok(())
    }
}

/// Writes each dispatch as one JSON line.
pub struct JsonLinesDispatcher<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesDispatcher<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Dispatcher for JsonLinesDispatcher<W> {
    fn dispatch(&mut self, dispatch: &Dispatch) -> Result<()> {
        let line = serde_json::to_string(dispatch).context("failed to encode dispatch")?;
        writeln!(self.writer, "{line}").context("failed to write dispatch")?;
        self.writer.flush().context("failed to flush dispatch")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use score_relay_core::MetricsRequest;

    fn metrics_request(request_id: &str) -> OutboundMessage {
        OutboundMessage::MetricsRequest(MetricsRequest {
            request_id: request_id.to_string(),
            entity_id: "0xabc".to_string(),
        })
    }

    #[test]
    fn unavailable_endpoints_refuse_delivery() {
        let mut dispatcher = RecordingDispatcher::new();
        dispatcher.set_unavailable("metrics-collector", true);

        let refused = dispatcher.dispatch(&Dispatch::new("metrics-collector", metrics_request("A")));
        assert!(refused.is_err());
        assert!(dispatcher.sent().is_empty());

        dispatcher.set_unavailable("metrics-collector", false);
        let accepted = dispatcher.dispatch(&Dispatch::new("metrics-collector", metrics_request("A")));
        assert!(accepted.is_ok());
        assert_eq!(dispatcher.sent_to("metrics-collector").count(), 1);
    }

    #[test]
    fn json_lines_carry_envelope_and_type_tag() {
        let mut dispatcher = JsonLinesDispatcher::new(Vec::new());
        assert!(dispatcher
            .dispatch(&Dispatch::new("metrics-collector", metrics_request("A")))
            .is_ok());
        assert!(dispatcher
            .dispatch(&Dispatch::new("metrics-collector", metrics_request("B")))
            .is_ok());

        let bytes = dispatcher.into_inner();
        let text = String::from_utf8_lossy(&bytes);
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = match serde_json::from_str(lines[0]) {
            Ok(value) => value,
            Err(err) => panic!("expected JSON line: {err}"),
        };
        assert_eq!(first["endpoint"], "metrics-collector");
        assert_eq!(first["message"]["type"], "metrics_request");
        assert_eq!(first["message"]["request_id"], "A");
        assert!(first["message_id"].as_str().is_some_and(|id| id.len() == 26));
    }
}

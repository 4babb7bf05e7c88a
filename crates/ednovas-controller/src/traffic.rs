//! `/traffic` WebSocket stream.

use futures_util::stream::{BoxStream, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMsg;

use crate::client::ControlClient;
use crate::error::{ControlError, Result};
use crate::types::Traffic;

impl ControlClient {
    /// Open the live traffic feed. Each item is one per-second sample.
    ///
    /// The stream ends when the core closes the socket.
    pub async fn traffic(&self) -> Result<BoxStream<'static, Result<Traffic>>> {
        let url = traffic_url(self.base_url(), self.secret());
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        tracing::debug!("traffic stream connected");

        let (_write, read) = ws_stream.split();
        let samples = read.filter_map(|msg| async move {
            match msg {
                Ok(WsMsg::Text(text)) => Some(
                    serde_json::from_str::<Traffic>(text.as_str()).map_err(|e| {
                        ControlError::Decode {
                            path: "/traffic".to_string(),
                            reason: e.to_string(),
                        }
                    }),
                ),
                Ok(_) => None,
                Err(e) => Some(Err(ControlError::WebSocket(e))),
            }
        });
        Ok(samples.boxed())
    }
}

fn traffic_url(base_url: &str, secret: Option<&str>) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    };
    let token = urlencoding::encode(secret.unwrap_or_default());
    format!("{ws_base}/traffic?token={token}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traffic_url_swaps_scheme_and_carries_token() {
        assert_eq!(
            traffic_url("http://127.0.0.1:9090", None),
            "ws://127.0.0.1:9090/traffic?token="
        );
        assert_eq!(
            traffic_url("http://127.0.0.1:9090", Some("a b")),
            "ws://127.0.0.1:9090/traffic?token=a%20b"
        );
    }
}

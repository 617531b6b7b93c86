//! HTTP render requests to webnodes.
//!
//! Hitting `/pdf/{idv}` or `/html/{idv}/` on a webnode makes it render the
//! artifact into the ps_cache before answering. The answer itself is only
//! logged; whether the file appeared is checked on the filesystem.

use async_trait::async_trait;
use paper_sync_core::artifact::ArtifactKind;
use paper_sync_core::config::Webnode;
use paper_sync_core::contract::{BoxError, RenderClient, RenderReceipt};
use std::time::{Duration, Instant};
use tracing::debug;

/// `http` for local development hosts, `https` for everything else.
pub fn render_url(host: &str, kind: ArtifactKind, idv: &str) -> String {
    let proto = if host.starts_with("localhost:") {
        "http"
    } else {
        "https"
    };
    match kind {
        ArtifactKind::Pdf => format!("{proto}://{host}/pdf/{idv}"),
        ArtifactKind::Html => format!("{proto}://{host}/html/{idv}/"),
    }
}

pub struct HttpRenderClient {
    http: reqwest::Client,
}

impl HttpRenderClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("paper-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl RenderClient for HttpRenderClient {
    async fn request_render(
        &self,
        host: &Webnode,
        kind: ArtifactKind,
        idv: &str,
        timeout: Duration,
    ) -> Result<RenderReceipt, BoxError> {
        let url = render_url(&host.host, kind, idv);
        let started = Instant::now();
        let response = self.http.get(&url).timeout(timeout).send().await?;
        let receipt = RenderReceipt {
            source_url: url,
            status: response.status().as_u16(),
            duration: started.elapsed(),
        };
        debug!(url = %receipt.source_url, status = receipt.status, "Webnode answered");
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_follow_kind_and_host() {
        assert_eq!(
            render_url("web3.arxiv.org", ArtifactKind::Pdf, "1208.9998v2"),
            "https://web3.arxiv.org/pdf/1208.9998v2"
        );
        assert_eq!(
            render_url("localhost:8080", ArtifactKind::Html, "1208.9998v2"),
            "http://localhost:8080/html/1208.9998v2/"
        );
        assert_eq!(
            render_url("web3.arxiv.org", ArtifactKind::Html, "hep-th/9901001v1"),
            "https://web3.arxiv.org/html/hep-th/9901001v1/"
        );
    }
}

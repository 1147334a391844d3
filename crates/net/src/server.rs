//! HTTP server answering peer requests from the local store.
//!
//! Serves `GET {node_path}/recent|head|have|get/...` with one line per
//! item in the body.

use bytes::Bytes;
use datsync_common::RecentLine;
use datsync_peer::{PeerRequest, HAVE_YES};
use datsync_storage::Store;
use datsync_sync::{RecentIndex, SuggestedTags, ThreadCache};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct PeerServer {
    node_path: String,
    recent: Arc<RecentIndex>,
}

impl std::fmt::Debug for PeerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerServer")
            .field("node_path", &self.node_path)
            .finish_non_exhaustive()
    }
}

impl PeerServer {
    pub fn new(node_path: &str, recent: Arc<RecentIndex>) -> Self {
        Self {
            node_path: node_path.trim_end_matches('/').to_string(),
            recent,
        }
    }

    fn store(&self) -> &Store {
        self.recent.store()
    }

    /// Map a URI path to a request, if it is one we serve.
    pub fn route(&self, path: &str) -> Option<PeerRequest> {
        PeerRequest::parse(path.strip_prefix(self.node_path.as_str())?)
    }

    /// Lines answering `request`.
    pub async fn answer(&self, request: &PeerRequest) -> Vec<String> {
        match request {
            PeerRequest::Recent { begin } => {
                let heads = self.recent.heads_since(*begin).await;
                self.store()
                    .view(|tx| {
                        heads
                            .into_iter()
                            .map(|head| {
                                let tags = SuggestedTags::get(tx, &head.datfile);
                                RecentLine { head, tags }.to_line()
                            })
                            .collect()
                    })
                    .await
            }
            PeerRequest::Head { datfile, begin } => match self.thread(datfile) {
                Some(cache) => cache
                    .heads_since(*begin)
                    .await
                    .iter()
                    .map(|h| h.head_line())
                    .collect(),
                None => Vec::new(),
            },
            PeerRequest::Have { datfile } => match self.thread(datfile) {
                Some(cache) if cache.has_record().await => vec![HAVE_YES.to_string()],
                _ => Vec::new(),
            },
            PeerRequest::Get { datfile, from, to } => match self.thread(datfile) {
                Some(cache) => cache
                    .records_in(*from, *to)
                    .await
                    .iter()
                    .map(|r| r.to_line())
                    .collect(),
                None => Vec::new(),
            },
        }
    }

    fn thread(&self, datfile: &str) -> Option<ThreadCache> {
        ThreadCache::new(datfile, self.store().clone()).ok()
    }

    async fn handle(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
        if req.method() != Method::GET {
            return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, String::new()));
        }
        let request = match self.route(req.uri().path()) {
            Some(request) => request,
            None => {
                tracing::debug!("no route for {}", req.uri().path());
                return Ok(respond(StatusCode::NOT_FOUND, String::new()));
            }
        };

        let lines = self.answer(&request).await;
        tracing::debug!("{} -> {} line(s)", request.path(), lines.len());
        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        Ok(respond(StatusCode::OK, body))
    }

    /// Serve peers on `listener` until the task is dropped.
    ///
    /// Call from a `tokio::spawn`.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!(
            "peer server listening on http://{}{}",
            listener.local_addr()?,
            self.node_path
        );
        loop {
            let (stream, remote) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| server.clone().handle(req));
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!("peer connection from {} failed: {}", remote, e);
                }
            });
        }
    }
}

fn respond(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

//! Static-file HTTP surface: serves `<root-dir>` as a tree, reverse-proxying to an
//! upstream mirror on 404, with a special case for `timestamp.json` that invokes the
//! reconciliation driver before serving.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use repo_mirror_core::{Reconciler, UpstreamClient};
use tiny_http::{Method, Request, Response, Server};

/// Downloads the upstream mirror's current manifests into `<tiuphome>/manifests` over
/// HTTP. The only files this client needs to fetch are the ones the reconciliation
/// driver reads back out of that directory: root/snapshot/timestamp/index and whatever
/// component manifests the index names.
pub struct HttpUpstreamClient {
    base_url: String,
    manifests_dir: PathBuf,
}

impl HttpUpstreamClient {
    pub fn new(base_url: String, manifests_dir: PathBuf) -> Self {
        HttpUpstreamClient {
            base_url,
            manifests_dir,
        }
    }

    fn fetch_into(&self, name: &str) -> std::result::Result<(), String> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), name);
        let response = ureq::get(&url)
            .call()
            .map_err(|e| format!("GET {} failed: {}", url, e))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| format!("reading {} failed: {}", url, e))?;
        std::fs::write(self.manifests_dir.join(name), &bytes)
            .map_err(|e| format!("writing {} failed: {}", name, e))?;
        Ok(())
    }
}

impl UpstreamClient for HttpUpstreamClient {
    fn refresh(&self) -> std::result::Result<(), String> {
        std::fs::create_dir_all(&self.manifests_dir)
            .map_err(|e| format!("creating manifests dir failed: {}", e))?;

        self.fetch_into("root.json")?;
        self.fetch_into("snapshot.json")?;
        self.fetch_into("timestamp.json")?;
        self.fetch_into("index.json")?;

        let index_bytes = std::fs::read(self.manifests_dir.join("index.json"))
            .map_err(|e| format!("reading fetched index.json failed: {}", e))?;
        let index: repo_mirror_schema::Manifest<repo_mirror_schema::IndexSigned> =
            repo_mirror_schema::from_json(&index_bytes)
                .map_err(|e| format!("decoding fetched index.json failed: {}", e))?;
        for component in index.signed.components.keys() {
            self.fetch_into(&format!("{}.json", component))?;
        }
        Ok(())
    }
}

/// Used when no upstream is configured: requests for `timestamp.json` serve the local
/// tree as-is, with reconciliation becoming a no-op (no files ever appear "changed").
pub struct NoUpstreamClient;

impl UpstreamClient for NoUpstreamClient {
    fn refresh(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

pub fn serve(
    server: Server,
    root_dir: PathBuf,
    upstream_base: Option<String>,
    reconciler: Arc<Reconciler>,
) {
    for request in server.incoming_requests() {
        handle_one(request, &root_dir, upstream_base.as_deref(), &reconciler);
    }
}

fn handle_one(
    request: Request,
    root_dir: &Path,
    upstream_base: Option<&str>,
    reconciler: &Reconciler,
) {
    if *request.method() != Method::Get {
        let _ = request.respond(Response::empty(405));
        return;
    }

    let requested = request.url().trim_start_matches('/').to_string();
    if requested == "timestamp.json" {
        if let Err(e) = reconciler.merge_upstream() {
            log::error!("reconciliation failed: {}", e);
        }
    }

    let path = root_dir.join(&requested);
    match File::open(&path) {
        Ok(file) => {
            let _ = request.respond(Response::from_file(file));
        }
        Err(_) => match upstream_base {
            Some(base) => serve_from_upstream(request, base, &requested),
            None => {
                let _ = request.respond(Response::empty(404));
            }
        },
    }
}

fn serve_from_upstream(request: Request, base: &str, requested: &str) {
    let url = format!("{}/{}", base.trim_end_matches('/'), requested);
    match ureq::get(&url).call() {
        Ok(response) => {
            let mut body = Vec::new();
            if response.into_reader().read_to_end(&mut body).is_ok() {
                let _ = request.respond(Response::from_data(body));
            } else {
                let _ = request.respond(Response::empty(404));
            }
        }
        Err(_) => {
            let _ = request.respond(Response::empty(404));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo_mirror_core::UpstreamCache;

    fn spawn(root_dir: PathBuf, upstream_base: Option<String>) -> String {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_string();

        let (index, snapshot, timestamp, owner) = (
            repo_mirror_signer::generate_ed25519_for_test(),
            repo_mirror_signer::generate_ed25519_for_test(),
            repo_mirror_signer::generate_ed25519_for_test(),
            repo_mirror_signer::generate_ed25519_for_test(),
        );
        let manifests_dir = root_dir.join(".tiup").join("manifests");
        std::fs::create_dir_all(&manifests_dir).unwrap();
        let cache = UpstreamCache::new(manifests_dir, Arc::new(NoUpstreamClient)).unwrap();
        let reconciler = Arc::new(Reconciler::new(
            root_dir.clone(),
            cache,
            index,
            snapshot,
            timestamp,
            owner,
        ));

        std::thread::spawn(move || serve(server, root_dir, upstream_base, reconciler));
        addr
    }

    #[test]
    fn serves_an_existing_file_from_the_root_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("snapshot.json"), b"hello-snapshot").unwrap();
        let addr = spawn(dir.path().to_path_buf(), None);

        let response = ureq::get(&format!("http://{}/snapshot.json", addr))
            .call()
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.into_string().unwrap(), "hello-snapshot");
    }

    #[test]
    fn missing_file_with_no_upstream_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let addr = spawn(dir.path().to_path_buf(), None);

        let err = ureq::get(&format!("http://{}/nope.json", addr)).call();
        assert!(matches!(err, Err(ureq::Error::Status(404, _))));
    }

    #[test]
    fn missing_file_falls_through_to_upstream_reverse_proxy() {
        let upstream_dir = tempfile::tempdir().unwrap();
        std::fs::write(upstream_dir.path().join("root.json"), b"upstream-root").unwrap();
        let upstream_server = Server::http("127.0.0.1:0").unwrap();
        let upstream_addr = upstream_server.server_addr().to_string();
        let upstream_root = upstream_dir.path().to_path_buf();
        std::thread::spawn(move || {
            serve(upstream_server, upstream_root, None, Arc::new(Reconciler::new(
                tempfile::tempdir().unwrap().keep(),
                UpstreamCache::new(
                    tempfile::tempdir().unwrap().keep(),
                    Arc::new(NoUpstreamClient),
                )
                .unwrap(),
                repo_mirror_signer::generate_ed25519_for_test(),
                repo_mirror_signer::generate_ed25519_for_test(),
                repo_mirror_signer::generate_ed25519_for_test(),
                repo_mirror_signer::generate_ed25519_for_test(),
            )))
        });

        let dir = tempfile::tempdir().unwrap();
        let addr = spawn(
            dir.path().to_path_buf(),
            Some(format!("http://{}", upstream_addr)),
        );

        let response = ureq::get(&format!("http://{}/root.json", addr))
            .call()
            .unwrap();
        assert_eq!(response.into_string().unwrap(), "upstream-root");
    }

    #[test]
    fn timestamp_request_triggers_reconciliation_but_always_serves_current_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("timestamp.json"), b"current-timestamp").unwrap();
        let addr = spawn(dir.path().to_path_buf(), None);

        let response = ureq::get(&format!("http://{}/timestamp.json", addr))
            .call()
            .unwrap();
        assert_eq!(response.into_string().unwrap(), "current-timestamp");
    }
}


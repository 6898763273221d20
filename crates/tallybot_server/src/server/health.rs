#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::warn;

use crate::engine::subscriptions::SessionState;

/// Readiness flag: ready while the notification session is connected.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_ready(&self, ready: bool) {
		self.ready.store(ready, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	/// Mirror session state changes into the readiness flag until the sender goes away.
	pub fn track_session(&self, mut states: watch::Receiver<SessionState>) {
		let this = self.clone();
		tokio::spawn(async move {
			loop {
				let connected = matches!(*states.borrow_and_update(), SessionState::Connected { .. });
				this.set_ready(connected);
				if states.changed().await.is_err() {
					this.set_ready(false);
					break;
				}
			}
		});
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn respond(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body)));
	*resp.status_mut() = status;
	resp
}

fn route(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if *method != Method::GET {
		return respond(StatusCode::METHOD_NOT_ALLOWED, b"");
	}

	match path {
		"/healthz" => respond(StatusCode::OK, b"ok"),
		"/readyz" if state.is_ready() => respond(StatusCode::OK, b"ready"),
		"/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, b"not-ready"),
		_ => respond(StatusCode::NOT_FOUND, b""),
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route(req.method(), req.uri().path(), &state))
}

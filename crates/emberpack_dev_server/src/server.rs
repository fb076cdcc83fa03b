use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use axum::Router;
use axum::extract::Request;
use axum::extract::State;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::http::header;
use axum::middleware;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use futures::SinkExt;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use emberpack_core::diagnostic::Diagnostic;
use emberpack_core::graph::Graph;
use emberpack_core::types::ChunkPart;
use emberpack_core::types::FileContent;

use crate::chunk::Chunk;
use crate::chunk::ChunkAssembler;
use crate::chunk::ChunkKind;
use crate::compile::Compiler;
use crate::compile::Resolver;
use crate::hmr::BuildDelivery;
use crate::hmr::HmrCoordinator;
use crate::options::DevServerOptions;
use crate::protocol::ClientMessage;
use crate::protocol::ServerMessage;
use crate::protocol::SyncEvent;
use crate::tracer::ChangeTracer;
use crate::watch::WatchBatch;
use crate::watch::WatchEvent;
use crate::watch::WatchEventKind;
use crate::watch::WatcherHandle;
use crate::watch::debounce;
use crate::watch::spawn_fs_watcher;

/// Gate for HTTP requests: while a batch is building, requests wait so a page
/// load never observes a half-applied update.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildState {
  Building,
  Ready,
}

/// Latest full chunks, swapped in whole after each build pass.
#[derive(Debug, Default)]
struct ChunkStore {
  js: Mutex<Option<Chunk>>,
  css: Mutex<Option<Chunk>>,
}

impl ChunkStore {
  fn store(&self, chunk: Chunk) {
    match chunk.kind {
      ChunkKind::JavaScript => *self.js.lock().unwrap() = Some(chunk),
      ChunkKind::Css => *self.css.lock().unwrap() = Some(chunk),
    }
  }

  fn js(&self) -> Option<Chunk> {
    self.js.lock().unwrap().clone()
  }

  fn css(&self) -> Option<Chunk> {
    self.css.lock().unwrap().clone()
  }
}

#[derive(Clone)]
struct AppState {
  coordinator: Arc<HmrCoordinator>,
  chunks: Arc<ChunkStore>,
  build_state: watch::Receiver<BuildState>,
}

/// The dev server: serves the project over HTTP, keeps the module graph in
/// sync with the filesystem and pushes updates to connected HMR clients.
#[derive(Debug)]
pub struct DevServer {
  options: DevServerOptions,
  project_root: PathBuf,
  entries: Vec<PathBuf>,
  compiler: Arc<dyn Compiler>,
  resolver: Arc<dyn Resolver>,
}

impl DevServer {
  pub fn new(
    options: DevServerOptions,
    project_root: impl Into<PathBuf>,
    entries: Vec<PathBuf>,
    compiler: Arc<dyn Compiler>,
    resolver: Arc<dyn Resolver>,
  ) -> Self {
    DevServer {
      options,
      project_root: project_root.into(),
      entries,
      compiler,
      resolver,
    }
  }

  /// Run the initial build, bind the listener, start the watch loop and the
  /// HTTP server. Resolves once the server accepts connections.
  pub async fn start(self) -> anyhow::Result<ServerHandle> {
    let coordinator = HmrCoordinator::new(self.options.ack_timeout);
    let chunks = Arc::new(ChunkStore::default());
    let (state_tx, state_rx) = watch::channel(BuildState::Building);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut graph = Graph::new();
    let mut tracer = ChangeTracer::new(
      Arc::clone(&self.compiler),
      Arc::clone(&self.resolver),
      self.options.block_on_websockets,
    );
    let assembler = ChunkAssembler::new(&self.project_root);

    // Entry records exist, and are flagged, before the first pass runs.
    let mut seed = WatchBatch::new();
    for entry in &self.entries {
      let id = graph.get_or_create(entry);
      graph.node_mut(id)?.is_entry = true;
      seed.push(WatchEvent::new(WatchEventKind::Created, entry.clone()));
    }
    let outcome = tracer.trace(&mut graph, &seed).await?;
    for diagnostic in &outcome.errors {
      tracing::warn!(%diagnostic, "initial build diagnostic");
    }
    refresh_chunks(&assembler, &graph, &chunks);
    let _ = state_tx.send(BuildState::Ready);

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let watcher = spawn_fs_watcher(&self.project_root, event_tx)?;
    let (batch_tx, batch_rx) = mpsc::channel(16);
    tokio::spawn(debounce(event_rx, self.options.watch_debounce, batch_tx));

    tokio::spawn(build_loop(BuildLoop {
      graph,
      tracer,
      assembler,
      chunks: Arc::clone(&chunks),
      coordinator: Arc::clone(&coordinator),
      state_tx,
      batch_rx,
      shutdown: shutdown_rx.clone(),
    }));

    let state = AppState {
      coordinator: Arc::clone(&coordinator),
      chunks,
      build_state: state_rx.clone(),
    };
    let app = router(state, &self.project_root);

    let addr = SocketAddr::from(([127, 0, 0, 1], self.options.port));
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "dev server listening");

    let mut server_shutdown = shutdown_rx;
    tokio::spawn(async move {
      let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
          let _ = server_shutdown.changed().await;
        })
        .await;
      if let Err(error) = result {
        tracing::error!(%error, "dev server exited with error");
      }
    });

    Ok(ServerHandle {
      addr,
      coordinator,
      build_state: state_rx,
      shutdown: shutdown_tx,
      _watcher: watcher,
    })
  }
}

/// Running-server handle. Dropping it stops file watching; [`stop`] shuts the
/// whole server down.
///
/// [`stop`]: ServerHandle::stop
pub struct ServerHandle {
  addr: SocketAddr,
  coordinator: Arc<HmrCoordinator>,
  build_state: watch::Receiver<BuildState>,
  shutdown: watch::Sender<bool>,
  _watcher: WatcherHandle,
}

impl ServerHandle {
  pub fn addr(&self) -> SocketAddr {
    self.addr
  }

  pub fn client_count(&self) -> usize {
    self.coordinator.client_count()
  }

  pub fn build_state(&self) -> watch::Receiver<BuildState> {
    self.build_state.clone()
  }

  pub async fn wait_until_ready(&self) {
    let mut rx = self.build_state.clone();
    while *rx.borrow() != BuildState::Ready {
      if rx.changed().await.is_err() {
        return;
      }
    }
  }

  pub fn stop(&self) {
    let _ = self.shutdown.send(true);
  }
}

struct BuildLoop {
  graph: Graph,
  tracer: ChangeTracer,
  assembler: ChunkAssembler,
  chunks: Arc<ChunkStore>,
  coordinator: Arc<HmrCoordinator>,
  state_tx: watch::Sender<BuildState>,
  batch_rx: mpsc::Receiver<WatchBatch>,
  shutdown: watch::Receiver<bool>,
}

/// Owner task for the graph: receives coalesced watch batches and runs one
/// build pass at a time. Nothing else ever touches the graph.
async fn build_loop(mut ctx: BuildLoop) {
  loop {
    let batch = tokio::select! {
      _ = ctx.shutdown.changed() => break,
      batch = ctx.batch_rx.recv() => match batch {
        Some(batch) => batch,
        None => break,
      },
    };

    let _ = ctx.state_tx.send(BuildState::Building);
    ctx.coordinator.seen_files();

    match ctx.tracer.trace(&mut ctx.graph, &batch).await {
      Ok(outcome) => {
        let mut delivery = BuildDelivery {
          errors: outcome.errors.clone(),
          requires_reload: outcome.requires_reload,
          ..Default::default()
        };

        if outcome.did_bundle() && !outcome.parts.is_empty() {
          match ctx.assembler.assemble(&ctx.graph, &outcome.parts) {
            Ok(built) => {
              delivery.chunks = built
                .into_iter()
                .map(|chunk| ServerMessage::Chunk {
                  generation: chunk.generation,
                  code: chunk.code.into_bytes(),
                })
                .collect();
            }
            Err(error) => {
              tracing::error!(%error, "hmr chunk assembly failed");
              delivery.errors.push(Diagnostic::new(error.to_string()));
            }
          }
          // Page loads get the whole graph, not the delta.
          refresh_chunks(&ctx.assembler, &ctx.graph, &ctx.chunks);
        }

        let batch_number = ctx.coordinator.publish(outcome.event, delivery);
        if outcome.event == SyncEvent::AnyBuildFinishedWaitForWebSockets {
          ctx.coordinator.wait_for_acks(batch_number).await;
        }
      }
      Err(error) => tracing::error!(%error, "build pass failed"),
    }

    let _ = ctx.state_tx.send(BuildState::Ready);
  }
}

/// Every ready file in the graph, for full-chunk assembly.
fn collect_parts(graph: &Graph) -> Vec<ChunkPart> {
  graph
    .files()
    .iter()
    .filter_map(|(id, node)| match &node.content {
      FileContent::Ready(_) => Some(ChunkPart {
        file: id,
        tag: node.tag,
        generation: node.generation,
      }),
      FileContent::Unknown { .. } | FileContent::Pending => None,
    })
    .collect()
}

fn refresh_chunks(assembler: &ChunkAssembler, graph: &Graph, chunks: &ChunkStore) {
  match assembler.assemble(graph, &collect_parts(graph)) {
    Ok(built) => {
      for chunk in built {
        chunks.store(chunk);
      }
    }
    Err(error) => tracing::error!(%error, "full chunk assembly failed"),
  }
}

fn router(state: AppState, project_root: &Path) -> Router {
  Router::new()
    .route("/_emberpack/hmr", get(hmr_upgrade))
    .route("/_emberpack/chunk.js", get(chunk_js))
    .route("/_emberpack/chunk.js.map", get(chunk_js_map))
    .route("/_emberpack/chunk.css", get(chunk_css))
    .route("/_emberpack/chunk.css.map", get(chunk_css_map))
    .fallback_service(ServeDir::new(project_root))
    .layer(middleware::from_fn_with_state(state.clone(), ready_gate))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

async fn ready_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
  let mut rx = state.build_state.clone();
  while *rx.borrow() != BuildState::Ready {
    if rx.changed().await.is_err() {
      break;
    }
  }
  next.run(request).await
}

async fn hmr_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
  ws.on_upgrade(move |socket| hmr_session(socket, state.coordinator))
}

async fn hmr_session(socket: WebSocket, coordinator: Arc<HmrCoordinator>) {
  let (mut sink, mut stream) = socket.split();
  let (tx, mut rx) = mpsc::unbounded_channel();
  let session = coordinator.connect(tx);

  let writer = tokio::spawn(async move {
    while let Some(message) = rx.recv().await {
      if sink
        .send(Message::Binary(message.encode().into()))
        .await
        .is_err()
      {
        break;
      }
    }
  });

  while let Some(Ok(message)) = stream.next().await {
    match message {
      Message::Binary(frame) => match ClientMessage::decode(&frame) {
        Ok(client_message) => coordinator.handle_message(session, client_message),
        Err(error) => tracing::debug!(session, %error, "undecodable client frame"),
      },
      Message::Close(_) => break,
      _ => {}
    }
  }

  coordinator.disconnect(session);
  writer.abort();
}

async fn chunk_js(State(state): State<AppState>) -> Response {
  match state.chunks.js() {
    Some(chunk) => {
      let code = format!(
        "{}\n//# sourceMappingURL=/_emberpack/chunk.js.map\n",
        chunk.code
      );
      (
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        code,
      )
        .into_response()
    }
    None => StatusCode::NOT_FOUND.into_response(),
  }
}

async fn chunk_js_map(State(state): State<AppState>) -> Response {
  serve_map(state.chunks.js())
}

async fn chunk_css(State(state): State<AppState>) -> Response {
  match state.chunks.css() {
    Some(chunk) => {
      let code = format!(
        "{}\n/*# sourceMappingURL=/_emberpack/chunk.css.map */\n",
        chunk.code
      );
      ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], code).into_response()
    }
    None => StatusCode::NOT_FOUND.into_response(),
  }
}

async fn chunk_css_map(State(state): State<AppState>) -> Response {
  serve_map(state.chunks.css())
}

fn serve_map(chunk: Option<Chunk>) -> Response {
  match chunk {
    Some(chunk) => (
      [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
      chunk.source_map,
    )
      .into_response(),
    None => StatusCode::NOT_FOUND.into_response(),
  }
}

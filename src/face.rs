use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::hands::Browser;
use crate::types::Screenshot;

/// Progress events streamed to the console via SSE.
#[derive(Clone, Debug)]
pub enum AgentEvent {
    TaskStarted { instruction: String },
    Thinking,
    Step { number: u32, description: String },
    StepError { message: String },
    Extracted { count: usize },
    TaskComplete { summary: String },
    TaskFailed { message: String },
    Ready,
}

impl AgentEvent {
    fn to_sse_event(&self) -> Event {
        match self {
            AgentEvent::TaskStarted { instruction } => Event::default()
                .event("task_started")
                .data(json!({ "instruction": instruction }).to_string()),
            AgentEvent::Thinking => Event::default().event("thinking").data("{}"),
            AgentEvent::Step {
                number,
                description,
            } => Event::default()
                .event("step")
                .data(json!({ "number": number, "description": description }).to_string()),
            AgentEvent::StepError { message } => Event::default()
                .event("step_error")
                .data(json!({ "message": message }).to_string()),
            AgentEvent::Extracted { count } => Event::default()
                .event("extracted")
                .data(json!({ "count": count }).to_string()),
            AgentEvent::TaskComplete { summary } => Event::default()
                .event("task_complete")
                .data(json!({ "summary": summary }).to_string()),
            AgentEvent::TaskFailed { message } => Event::default()
                .event("task_failed")
                .data(json!({ "message": message }).to_string()),
            AgentEvent::Ready => Event::default().event("ready").data("{}"),
        }
    }
}

/// A task submitted from the console.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskCommand {
    pub instruction: String,
    pub url: String,
}

#[derive(Clone)]
struct AppState {
    cmd_tx: mpsc::Sender<TaskCommand>,
    event_tx: broadcast::Sender<AgentEvent>,
    browser: Arc<dyn Browser>,
}

/// Serve the console on localhost. Returns the command receiver the task
/// runner drains and the event sender the engine publishes to.
pub async fn start_server(
    browser: Arc<dyn Browser>,
) -> (mpsc::Receiver<TaskCommand>, broadcast::Sender<AgentEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<TaskCommand>(1);
    let (event_tx, _) = broadcast::channel::<AgentEvent>(64);

    let state = Arc::new(AppState {
        cmd_tx,
        event_tx: event_tx.clone(),
        browser,
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/events", get(sse_handler))
        .route("/screenshot", get(screenshot_handler))
        .route(
            "/favicon.ico",
            get(|| async { StatusCode::NO_CONTENT }),
        )
        .with_state(state);

    // Prefer 3000, fall back to the next few ports if taken.
    let mut listener = None;
    let mut port = 3000;
    for p in 3000..3010 {
        match tokio::net::TcpListener::bind(format!("127.0.0.1:{p}")).await {
            Ok(l) => {
                listener = Some(l);
                port = p;
                break;
            }
            Err(_) => continue,
        }
    }
    let listener = listener.expect("could not bind any port in 3000-3009");
    info!(port, "console running at http://localhost:{port}");

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (cmd_rx, event_tx)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TaskCommand>,
) -> &'static str {
    info!(instruction = %payload.instruction, url = %payload.url, "task submitted");
    let _ = state.cmd_tx.send(payload).await;
    "ok"
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream =
        BroadcastStream::new(rx).filter_map(|result: Result<AgentEvent, _>| match result {
            Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
            // Lagged subscribers just drop events.
            Err(_) => None,
        });
    Sse::new(stream)
}

async fn screenshot_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Screenshot>, StatusCode> {
    let browser = state.browser.clone();
    tokio::task::spawn_blocking(move || browser.screenshot())
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>webpilot console</title>
<style>
  body { margin: 0; background: #11131a; color: #d7dae3; font: 14px/1.5 system-ui, sans-serif; }
  .wrap { max-width: 920px; margin: 0 auto; padding: 20px; display: grid; gap: 14px; }
  h1 { font-size: 18px; margin: 0; }
  h1 small { color: #6b7184; font-weight: normal; margin-left: 8px; }
  form { display: grid; grid-template-columns: 2fr 1fr auto; gap: 8px; }
  input { background: #1a1d27; border: 1px solid #2a2e3d; border-radius: 6px; padding: 9px 12px; color: #fff; }
  input:focus { outline: none; border-color: #e8553d; }
  button { background: #e8553d; border: none; border-radius: 6px; color: #fff; padding: 9px 18px; cursor: pointer; font-weight: 600; }
  button:disabled { background: #3a3e4d; cursor: wait; }
  .cols { display: grid; grid-template-columns: 1fr 320px; gap: 14px; }
  #log, #shot { background: #161923; border: 1px solid #232736; border-radius: 8px; padding: 10px; min-height: 320px; max-height: 480px; overflow-y: auto; }
  #log div { padding: 3px 6px; border-radius: 4px; }
  #log .step { color: #8ab4ff; }
  #log .err { color: #ff8a80; }
  #log .done { color: #7ddb8a; }
  #log .data { color: #e8b659; }
  #log .think { color: #6b7184; font-style: italic; }
  #shot img { width: 100%; border-radius: 4px; }
  #shot button { width: 100%; margin-bottom: 8px; background: #2a2e3d; }
</style>
</head>
<body>
<div class="wrap">
  <h1>webpilot<small>one instruction, one browser, one step at a time</small></h1>
  <form id="f">
    <input id="instruction" placeholder="What should the agent do?" required>
    <input id="url" placeholder="https://target.page" required>
    <button id="go">Run</button>
  </form>
  <div class="cols">
    <div id="log"></div>
    <div>
      <div id="shot">
        <button type="button" onclick="refreshShot()">Refresh screenshot</button>
        <img id="shotimg" alt="">
      </div>
    </div>
  </div>
</div>
<script>
  const log = document.getElementById('log');
  const go = document.getElementById('go');
  function line(cls, text) {
    const d = document.createElement('div');
    d.className = cls;
    d.textContent = text;
    log.appendChild(d);
    log.scrollTop = log.scrollHeight;
  }
  document.getElementById('f').addEventListener('submit', async (e) => {
    e.preventDefault();
    const instruction = document.getElementById('instruction').value.trim();
    const url = document.getElementById('url').value.trim();
    if (!instruction || !url) return;
    go.disabled = true;
    line('step', '> ' + instruction);
    await fetch('/command', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({instruction, url}),
    });
  });
  async function refreshShot() {
    const r = await fetch('/screenshot');
    if (!r.ok) return;
    const s = await r.json();
    document.getElementById('shotimg').src = 'data:' + s.imageType + ';base64,' + s.imageBase64;
  }
  const es = new EventSource('/events');
  es.addEventListener('task_started', e => line('step', 'task started: ' + JSON.parse(e.data).instruction));
  es.addEventListener('thinking', () => line('think', 'thinking...'));
  es.addEventListener('step', e => { const d = JSON.parse(e.data); line('step', 'step ' + d.number + ': ' + d.description); });
  es.addEventListener('step_error', e => line('err', 'error: ' + JSON.parse(e.data).message));
  es.addEventListener('extracted', e => line('data', JSON.parse(e.data).count + ' records collected'));
  es.addEventListener('task_complete', e => { line('done', JSON.parse(e.data).summary); go.disabled = false; });
  es.addEventListener('task_failed', e => { line('err', 'task failed: ' + JSON.parse(e.data).message); go.disabled = false; });
  es.addEventListener('ready', () => { go.disabled = false; });
  line('done', 'agent ready');
</script>
</body>
</html>
"##;

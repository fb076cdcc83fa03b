use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchEventKind {
  Created,
  Modified,
  Deleted,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEvent {
  pub kind: WatchEventKind,
  pub path: PathBuf,
}

impl WatchEvent {
  pub fn new(kind: WatchEventKind, path: impl Into<PathBuf>) -> Self {
    WatchEvent {
      kind,
      path: path.into(),
    }
  }
}

/// One externally observed write burst, coalesced per path.
///
/// Coalescing keeps per-path net effects: a delete followed by a recreate
/// within the same window collapses to a modification of the same record, so
/// the graph never observes the intermediate missing state.
#[derive(Debug, Default)]
pub struct WatchBatch {
  order: Vec<PathBuf>,
  changes: HashMap<PathBuf, WatchEventKind>,
}

impl WatchBatch {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, event: WatchEvent) {
    match self.changes.get(&event.path) {
      None => {
        self.order.push(event.path.clone());
        self.changes.insert(event.path, event.kind);
      }
      Some(existing) => {
        let merged = merge(*existing, event.kind);
        self.changes.insert(event.path, merged);
      }
    }
  }

  pub fn is_empty(&self) -> bool {
    self.order.is_empty()
  }

  pub fn len(&self) -> usize {
    self.order.len()
  }

  /// Net change per path, in first-touch order.
  pub fn changes(&self) -> impl Iterator<Item = (&Path, WatchEventKind)> {
    self.order.iter().filter_map(|path| {
      self
        .changes
        .get(path)
        .map(|kind| (path.as_path(), *kind))
    })
  }
}

fn merge(first: WatchEventKind, second: WatchEventKind) -> WatchEventKind {
  use WatchEventKind::*;
  match (first, second) {
    // The record survived the window; a delete+recreate is a rewrite.
    (Deleted, Created) | (Deleted, Modified) => Modified,
    // Still unseen by any build, so it is simply a new file.
    (Created, Modified) => Created,
    (_, kind) => kind,
  }
}

/// Coalesce raw watcher events into batches separated by a quiet window.
///
/// A batch opens on the first event and closes once `window` elapses without
/// another. Runs until the event source closes.
pub async fn debounce(
  mut events: mpsc::UnboundedReceiver<WatchEvent>,
  window: Duration,
  batches: mpsc::Sender<WatchBatch>,
) {
  while let Some(first) = events.recv().await {
    let mut batch = WatchBatch::new();
    batch.push(first);

    loop {
      match timeout(window, events.recv()).await {
        Ok(Some(event)) => batch.push(event),
        Ok(None) => {
          let _ = batches.send(batch).await;
          return;
        }
        Err(_) => break,
      }
    }

    tracing::debug!(files = batch.len(), "watch batch closed");
    if batches.send(batch).await.is_err() {
      return;
    }
  }
}

/// Handle keeping the underlying `notify` watcher alive. Dropping it stops
/// file watching.
pub struct WatcherHandle {
  _inner: RecommendedWatcher,
}

/// Watch `root` recursively, translating `notify` events into [`WatchEvent`]s
/// on the returned channel. Pair with [`debounce`] to produce batches.
pub fn spawn_fs_watcher(
  root: &Path,
  events: mpsc::UnboundedSender<WatchEvent>,
) -> notify::Result<WatcherHandle> {
  let mut watcher = RecommendedWatcher::new(
    move |result: notify::Result<notify::Event>| {
      let event = match result {
        Ok(event) => event,
        Err(error) => {
          tracing::warn!(%error, "file watch error");
          return;
        }
      };
      let kind = match event.kind {
        notify::EventKind::Create(_) => WatchEventKind::Created,
        notify::EventKind::Modify(_) => WatchEventKind::Modified,
        notify::EventKind::Remove(_) => WatchEventKind::Deleted,
        _ => return,
      };
      for path in event.paths {
        let _ = events.send(WatchEvent::new(kind, path));
      }
    },
    notify::Config::default(),
  )?;

  watcher.watch(root, RecursiveMode::Recursive)?;
  tracing::info!(root = %root.display(), "file watcher started");

  Ok(WatcherHandle { _inner: watcher })
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn collect(batch: &WatchBatch) -> Vec<(PathBuf, WatchEventKind)> {
    batch
      .changes()
      .map(|(path, kind)| (path.to_path_buf(), kind))
      .collect()
  }

  #[test]
  fn delete_then_recreate_coalesces_to_modified() {
    let mut batch = WatchBatch::new();
    batch.push(WatchEvent::new(WatchEventKind::Deleted, "/app/util.js"));
    batch.push(WatchEvent::new(WatchEventKind::Created, "/app/util.js"));

    assert_eq!(
      collect(&batch),
      vec![(PathBuf::from("/app/util.js"), WatchEventKind::Modified)]
    );
  }

  #[test]
  fn create_then_modify_stays_created() {
    let mut batch = WatchBatch::new();
    batch.push(WatchEvent::new(WatchEventKind::Created, "/app/new.ts"));
    batch.push(WatchEvent::new(WatchEventKind::Modified, "/app/new.ts"));

    assert_eq!(
      collect(&batch),
      vec![(PathBuf::from("/app/new.ts"), WatchEventKind::Created)]
    );
  }

  #[test]
  fn modify_then_delete_is_a_delete() {
    let mut batch = WatchBatch::new();
    batch.push(WatchEvent::new(WatchEventKind::Modified, "/app/a.ts"));
    batch.push(WatchEvent::new(WatchEventKind::Deleted, "/app/a.ts"));

    assert_eq!(
      collect(&batch),
      vec![(PathBuf::from("/app/a.ts"), WatchEventKind::Deleted)]
    );
  }

  #[test]
  fn first_touch_order_is_preserved() {
    let mut batch = WatchBatch::new();
    batch.push(WatchEvent::new(WatchEventKind::Modified, "/app/b.ts"));
    batch.push(WatchEvent::new(WatchEventKind::Modified, "/app/a.ts"));
    batch.push(WatchEvent::new(WatchEventKind::Modified, "/app/b.ts"));

    let paths: Vec<PathBuf> = batch.changes().map(|(path, _)| path.to_path_buf()).collect();
    assert_eq!(paths, vec![PathBuf::from("/app/b.ts"), PathBuf::from("/app/a.ts")]);
  }

  #[tokio::test]
  async fn debounce_coalesces_a_burst_into_one_batch() {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (batch_tx, mut batch_rx) = mpsc::channel(4);

    tokio::spawn(debounce(event_rx, Duration::from_millis(20), batch_tx));

    event_tx
      .send(WatchEvent::new(WatchEventKind::Modified, "/app/a.ts"))
      .unwrap();
    event_tx
      .send(WatchEvent::new(WatchEventKind::Modified, "/app/b.ts"))
      .unwrap();
    drop(event_tx);

    let batch = batch_rx.recv().await.unwrap();
    assert_eq!(batch.len(), 2);
    assert!(batch_rx.recv().await.is_none());
  }
}

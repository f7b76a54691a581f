//! Keyframe sequencer.
//!
//! Holds the working frame list of the open project and plays it back
//! through a [`CommandSink`]. At most one playback task (the runner) exists
//! at a time; starting a new one aborts the previous runner first.
//!
//! ```text
//!   play / step ──► runner task ──► frame_commands ──► CommandSink
//!                        │                               (active arm)
//!                        └─ sleep(frame duration)
//! ```

use crate::domain::action::{clamp_duration, now_millis, ActionFrame, ActionProject, AXIS_COUNT};
use crate::error::{Error, Result};
use crate::infrastructure::protocol;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default hold time of frames captured from the live pose.
pub const CAPTURE_DURATION: Duration = Duration::from_millis(1000);

/// Destination for encoded arm commands.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// `true` iff the command was accepted for delivery.
    async fn send(&self, command: &str) -> bool;
}

/// Persistence used by [`Sequencer::save_project`].
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Insert a project and its frames, returning the new project id.
    async fn insert_project_with_frames(&self, project: &ActionProject) -> Result<i64>;

    /// Replace the stored project row and all of its frames.
    async fn update_project_with_frames(&self, project: &ActionProject) -> Result<()>;
}

/// Observable state shared with the runner task.
struct Shared {
    sink: Arc<dyn CommandSink>,
    frames: watch::Sender<Arc<Vec<ActionFrame>>>,
    playing: watch::Sender<bool>,
    current_index: watch::Sender<Option<usize>>,
    /// Bumped on every runner start and on stop. A runner only touches
    /// `playing`/`current_index` while its epoch is current.
    epoch: AtomicU64,
    /// Handle of the live runner. Held while the epoch is bumped and while
    /// a runner checks its epoch before publishing state.
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Run `publish` only if `epoch` is still the live runner.
    fn publish_if_current(&self, epoch: u64, publish: impl FnOnce(&Self)) -> bool {
        let _runner = self.runner.lock();
        if self.is_current(epoch) {
            publish(self);
            true
        } else {
            false
        }
    }

    async fn execute_frame(&self, frame: &ActionFrame) {
        for command in protocol::frame_commands(frame) {
            if !self.sink.send(&command).await {
                warn!(command = %command.trim_end(), "Axis command not delivered");
            }
        }
    }

    async fn run(&self, epoch: u64, start: usize, looping: bool) {
        let mut start = start;
        loop {
            let frames = self.frames.borrow().clone();
            if frames.is_empty() {
                break;
            }

            for (index, frame) in frames.iter().enumerate().skip(start) {
                let current = self.publish_if_current(epoch, |shared| {
                    shared.current_index.send_replace(Some(index));
                });
                if !current {
                    return;
                }
                self.execute_frame(frame).await;
                tokio::time::sleep(frame.duration()).await;
            }
            start = 0;

            if !(looping && *self.playing.borrow() && self.is_current(epoch)) {
                break;
            }
            debug!("Restarting loop");
        }

        let finished = self.publish_if_current(epoch, |shared| {
            shared.playing.send_replace(false);
            shared.current_index.send_replace(None);
        });
        if finished {
            info!("Playback finished");
        }
    }

    async fn run_step(&self, epoch: u64, index: usize) {
        let frame = self.frames.borrow().get(index).cloned();
        if let Some(frame) = frame {
            let current = self.publish_if_current(epoch, |shared| {
                shared.current_index.send_replace(Some(index));
            });
            if !current {
                return;
            }
            self.execute_frame(&frame).await;
            tokio::time::sleep(frame.duration()).await;
        }

        // The index stays so the next step continues from here.
        self.publish_if_current(epoch, |shared| {
            shared.playing.send_replace(false);
        });
    }
}

/// Working buffer and playback engine for one open project.
pub struct Sequencer {
    shared: Arc<Shared>,
    project: watch::Sender<Option<ActionProject>>,
}

impl Sequencer {
    pub fn new(sink: Arc<dyn CommandSink>) -> Self {
        let (frames, _) = watch::channel(Arc::new(Vec::new()));
        let (playing, _) = watch::channel(false);
        let (current_index, _) = watch::channel(None);
        let (project, _) = watch::channel(None);

        Self {
            shared: Arc::new(Shared {
                sink,
                frames,
                playing,
                current_index,
                epoch: AtomicU64::new(0),
                runner: Mutex::new(None),
            }),
            project,
        }
    }

    // ---- observation ----

    pub fn frames(&self) -> Arc<Vec<ActionFrame>> {
        self.shared.frames.borrow().clone()
    }

    pub fn is_playing(&self) -> bool {
        *self.shared.playing.borrow()
    }

    /// Index of the frame being (or last) executed, `None` when idle.
    pub fn current_index(&self) -> Option<usize> {
        *self.shared.current_index.borrow()
    }

    pub fn current_project(&self) -> Option<ActionProject> {
        self.project.borrow().clone()
    }

    pub fn subscribe_frames(&self) -> watch::Receiver<Arc<Vec<ActionFrame>>> {
        self.shared.frames.subscribe()
    }

    pub fn subscribe_playing(&self) -> watch::Receiver<bool> {
        self.shared.playing.subscribe()
    }

    pub fn subscribe_current_index(&self) -> watch::Receiver<Option<usize>> {
        self.shared.current_index.subscribe()
    }

    pub fn subscribe_project(&self) -> watch::Receiver<Option<ActionProject>> {
        self.project.subscribe()
    }

    // ---- playback ----

    /// Replace the runner with `task`, aborting any previous one, and
    /// mark playback as running.
    fn start_runner<F>(&self, task: impl FnOnce(Arc<Shared>, u64) -> F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut runner = self.shared.runner.lock();
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = runner.take() {
            previous.abort();
        }
        self.shared.playing.send_replace(true);
        *runner = Some(tokio::spawn(task(self.shared.clone(), epoch)));
    }

    /// Play from the current index (or the start) to the end, repeating
    /// while `looping` is set. No-op on an empty frame list.
    pub fn play(&self, looping: bool) {
        let len = self.shared.frames.borrow().len();
        if len == 0 {
            return;
        }

        let start = match self.current_index() {
            Some(index) if index + 1 < len => index,
            _ => 0,
        };

        info!(start, looping, frames = len, "Starting playback");
        self.start_runner(move |shared, epoch| async move {
            shared.run(epoch, start, looping).await;
        });
    }

    /// Execute the next frame (circular) once and keep its index.
    pub fn play_single_step(&self) {
        let len = self.shared.frames.borrow().len();
        if len == 0 {
            return;
        }

        let next = match self.current_index() {
            Some(index) => (index + 1) % len,
            None => 0,
        };

        debug!(index = next, "Single step");
        self.start_runner(move |shared, epoch| async move {
            shared.run_step(epoch, next).await;
        });
    }

    /// Stop any playback and loop from the current position.
    pub fn start_loop(&self) {
        if self.is_playing() {
            self.stop();
        }
        self.play(true);
    }

    pub fn toggle_play(&self, looping: bool) {
        if self.is_playing() {
            self.stop();
        } else {
            self.play(looping);
        }
    }

    /// Cancel playback and reset the position. Safe when idle.
    pub fn stop(&self) {
        let mut runner = self.shared.runner.lock();
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = runner.take() {
            task.abort();
        }
        self.shared.playing.send_replace(false);
        self.shared.current_index.send_replace(None);
    }

    // ---- working buffer ----

    fn edit_frames<R>(&self, edit: impl FnOnce(&mut Vec<ActionFrame>) -> R) -> R {
        let mut frames = Vec::clone(&self.shared.frames.borrow());
        let result = edit(&mut frames);
        self.shared.frames.send_replace(Arc::new(frames));
        result
    }

    /// Start an empty, unsaved project.
    pub fn create_new_project(&self, name: &str) -> Result<()> {
        let project = ActionProject::new(name)?;
        info!(name = %project.name(), "Created project");
        self.project.send_replace(Some(project));
        self.shared.frames.send_replace(Arc::new(Vec::new()));
        Ok(())
    }

    /// Open `project` and copy its frames into the working buffer.
    pub fn load_project(&self, project: ActionProject) {
        info!(id = project.id, name = %project.name(), frames = project.frames.len(), "Loaded project");
        self.shared
            .frames
            .send_replace(Arc::new(project.frames.clone()));
        self.project.send_replace(Some(project));
    }

    pub fn add_frame(&self, frame: ActionFrame) {
        self.edit_frames(|frames| frames.push(frame));
    }

    /// Append the given pose as a frame held for `duration`.
    pub fn capture_frame(&self, servos: [u16; AXIS_COUNT], duration: Duration) -> Result<()> {
        let sequence_id = i32::try_from(self.shared.frames.borrow().len()).unwrap_or(i32::MAX);
        let duration_ms = clamp_duration(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX));
        let frame = ActionFrame::new(sequence_id, duration_ms, servos, None)?;
        self.add_frame(frame);
        Ok(())
    }

    /// Replace the frame at `index`. Returns `false` if out of range.
    pub fn update_frame(&self, index: usize, frame: ActionFrame) -> bool {
        self.edit_frames(|frames| match frames.get_mut(index) {
            Some(slot) => {
                *slot = frame;
                true
            }
            None => false,
        })
    }

    pub fn delete_frame(&self, index: usize) -> bool {
        self.edit_frames(|frames| {
            if index < frames.len() {
                frames.remove(index);
                true
            } else {
                false
            }
        })
    }

    /// Insert before `index`, or append when `index` is past the end.
    pub fn insert_frame(&self, index: usize, frame: ActionFrame) {
        self.edit_frames(|frames| {
            let index = index.min(frames.len());
            frames.insert(index, frame);
        });
    }

    /// Move a frame. No-op unless both indices are in range.
    pub fn move_frame(&self, from: usize, to: usize) -> bool {
        self.edit_frames(|frames| {
            if from < frames.len() && to < frames.len() {
                let frame = frames.remove(from);
                frames.insert(to, frame);
                true
            } else {
                false
            }
        })
    }

    /// Append frames produced by an external importer.
    pub fn import_frames(&self, imported: Vec<ActionFrame>) -> usize {
        let count = imported.len();
        if count > 0 {
            self.edit_frames(|frames| frames.extend(imported));
            info!(count, "Imported frames");
        }
        count
    }

    /// Persist the open project with the working frames.
    ///
    /// Sequence ids are renumbered to list order, `modified_at` is
    /// refreshed, and an unsaved project receives its storage id.
    pub async fn save_project(&self, store: &dyn ProjectStore) -> Result<ActionProject> {
        let mut project = self.current_project().ok_or(Error::NoProjectLoaded)?;

        let frames: Vec<ActionFrame> = self
            .frames()
            .iter()
            .enumerate()
            .map(|(index, frame)| frame.clone().with_sequence_id(index as i32))
            .collect();
        project.frames = frames.clone();
        project.modified_at = now_millis();

        if project.is_saved() {
            store.update_project_with_frames(&project).await?;
        } else {
            project.id = store.insert_project_with_frames(&project).await?;
        }

        info!(id = project.id, name = %project.name(), frames = frames.len(), "Saved project");
        self.shared.frames.send_replace(Arc::new(frames));
        self.project.send_replace(Some(project.clone()));
        Ok(project)
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        if let Some(task) = self.shared.runner.lock().take() {
            task.abort();
        }
    }
}

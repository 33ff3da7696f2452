//! Per-project FIFO serialization.
//!
//! The command at the front of a project's queue is the active one. Waiters
//! are woken when a command completes and additionally re-check on a timer,
//! so a lost wake-up only costs one poll interval. A front entry whose
//! command has vanished or is already final is evicted by whoever notices.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use teamcloud_commands::RuntimeStatus;
use teamcloud_core::{CommandId, ProjectId};

#[derive(Debug)]
pub struct ProjectSerializer {
    queues: Mutex<HashMap<ProjectId, VecDeque<CommandId>>>,
    notify: Notify,
    poll_interval: Duration,
}

enum Turn {
    Active,
    Waiting { active: CommandId, ahead: usize },
}

impl ProjectSerializer {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            poll_interval,
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<ProjectId, VecDeque<CommandId>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `command_id` to the queue of `project`. Returns the number of
    /// commands ahead of it.
    pub fn enqueue(&self, project: ProjectId, command_id: CommandId) -> usize {
        let mut queues = self.queues();
        let queue = queues.entry(project).or_default();
        if let Some(position) = queue.iter().position(|id| *id == command_id) {
            return position;
        }
        queue.push_back(command_id);
        queue.len() - 1
    }

    /// Resolve once `command_id` is the active command of `project`.
    ///
    /// `status_of` reports the status of another command, `None` when it is
    /// unknown. An unknown or final front entry is treated as done.
    pub async fn wait_turn<P>(&self, project: ProjectId, command_id: CommandId, status_of: P)
    where
        P: Fn(CommandId) -> Option<RuntimeStatus>,
    {
        let mut announced = false;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.turn(project, command_id, &status_of) {
                Turn::Active => {
                    if announced {
                        info!(%project, %command_id, "queued command activated");
                    }
                    return;
                }
                Turn::Waiting { active, ahead } => {
                    if !announced {
                        info!(%project, %command_id, %active, ahead, "command queued behind active command");
                        announced = true;
                    }
                }
            }

            let _ = tokio::time::timeout(self.poll_interval, notified).await;
        }
    }

    fn turn<P>(&self, project: ProjectId, command_id: CommandId, status_of: &P) -> Turn
    where
        P: Fn(CommandId) -> Option<RuntimeStatus>,
    {
        let mut queues = self.queues();
        let queue = queues.entry(project).or_default();
        if !queue.contains(&command_id) {
            warn!(%project, %command_id, "command missing from project queue; re-enqueued");
            queue.push_back(command_id);
        }

        let mut evicted = false;
        let turn = loop {
            let Some(&front) = queue.front() else {
                break Turn::Active;
            };
            if front == command_id {
                break Turn::Active;
            }
            match status_of(front) {
                Some(status) if status.is_active() => {
                    let ahead = queue.iter().position(|id| *id == command_id).unwrap_or(0);
                    break Turn::Waiting { active: front, ahead };
                }
                status => {
                    debug!(%project, command_id = %front, ?status, "evicting finished active command");
                    queue.pop_front();
                    evicted = true;
                }
            }
        };
        drop(queues);

        if evicted {
            self.notify.notify_waiters();
        }
        turn
    }

    /// Remove `command_id` from its project queue and wake the waiters.
    pub fn complete(&self, project: ProjectId, command_id: CommandId) {
        {
            let mut queues = self.queues();
            if let Some(queue) = queues.get_mut(&project) {
                queue.retain(|id| *id != command_id);
                if queue.is_empty() {
                    queues.remove(&project);
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// The command currently at the front of the project's queue.
    pub fn active(&self, project: ProjectId) -> Option<CommandId> {
        self.queues().get(&project).and_then(|q| q.front().copied())
    }

    /// Commands waiting behind the active one, in activation order.
    pub fn queued(&self, project: ProjectId) -> Vec<CommandId> {
        self.queues()
            .get(&project)
            .map(|q| q.iter().skip(1).copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ids(n: usize) -> Vec<CommandId> {
        (0..n).map(|_| CommandId::new()).collect()
    }

    #[test]
    fn enqueue_reports_position_and_is_idempotent() {
        let serializer = ProjectSerializer::new(Duration::from_secs(1));
        let project = ProjectId::new();
        let [a, b] = [CommandId::new(), CommandId::new()];

        assert_eq!(serializer.enqueue(project, a), 0);
        assert_eq!(serializer.enqueue(project, b), 1);
        assert_eq!(serializer.enqueue(project, b), 1);
        assert_eq!(serializer.active(project), Some(a));
        assert_eq!(serializer.queued(project), vec![b]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_command_waits_until_first_completes() {
        let serializer = Arc::new(ProjectSerializer::new(Duration::from_secs(2)));
        let project = ProjectId::new();
        let [a, b] = [CommandId::new(), CommandId::new()];
        serializer.enqueue(project, a);
        serializer.enqueue(project, b);

        serializer
            .wait_turn(project, a, |_| Some(RuntimeStatus::Running))
            .await;

        let waiter = {
            let serializer = serializer.clone();
            tokio::spawn(async move {
                serializer
                    .wait_turn(project, b, |_| Some(RuntimeStatus::Running))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!waiter.is_finished());

        serializer.complete(project, a);
        waiter.await.unwrap();
        assert_eq!(serializer.active(project), Some(b));
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_or_final_front_is_evicted() {
        let serializer = ProjectSerializer::new(Duration::from_secs(2));
        let project = ProjectId::new();
        let ids = ids(3);
        for id in &ids {
            serializer.enqueue(project, *id);
        }
        let (gone, finished, next) = (ids[0], ids[1], ids[2]);

        serializer
            .wait_turn(project, next, |id| {
                if id == gone {
                    None
                } else if id == finished {
                    Some(RuntimeStatus::Completed)
                } else {
                    Some(RuntimeStatus::Running)
                }
            })
            .await;

        assert_eq!(serializer.active(project), Some(next));
        assert!(serializer.queued(project).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missed_wake_up_is_healed_by_polling() {
        let serializer = Arc::new(ProjectSerializer::new(Duration::from_secs(2)));
        let project = ProjectId::new();
        let [a, b] = [CommandId::new(), CommandId::new()];
        serializer.enqueue(project, a);
        serializer.enqueue(project, b);

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let waiter = {
            let serializer = serializer.clone();
            let done = done.clone();
            tokio::spawn(async move {
                serializer
                    .wait_turn(project, b, move |_| {
                        if done.load(std::sync::atomic::Ordering::SeqCst) {
                            Some(RuntimeStatus::Failed)
                        } else {
                            Some(RuntimeStatus::Running)
                        }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        // `a` finishes without ever calling complete().
        done.store(true, std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(waiter.is_finished());
        assert_eq!(serializer.active(project), Some(b));
    }

    #[test]
    fn projects_do_not_block_each_other() {
        let serializer = ProjectSerializer::new(Duration::from_secs(1));
        let (p1, p2) = (ProjectId::new(), ProjectId::new());
        let [a, b] = [CommandId::new(), CommandId::new()];

        assert_eq!(serializer.enqueue(p1, a), 0);
        assert_eq!(serializer.enqueue(p2, b), 0);

        serializer.complete(p1, a);
        assert_eq!(serializer.active(p1), None);
        assert_eq!(serializer.active(p2), Some(b));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn completion_order_is_submission_order(n in 1usize..12) {
                let serializer = ProjectSerializer::new(Duration::from_secs(1));
                let project = ProjectId::new();
                let ids = ids(n);
                for id in &ids {
                    serializer.enqueue(project, *id);
                }

                for id in &ids {
                    prop_assert_eq!(serializer.active(project), Some(*id));
                    serializer.complete(project, *id);
                }
                prop_assert_eq!(serializer.active(project), None);
            }
        }
    }
}

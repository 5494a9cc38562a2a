//! Inactivity tracking: ACTIVE -> WARNING -> EXPIRED.
//!
//! A timer armed for the next threshold drives the transitions. A periodic
//! check recomputes the phase from elapsed wall time as well, so a delayed
//! timer cannot postpone expiry indefinitely. Phase guards make every
//! transition fire once however many checks observe it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::SessionConfig;
use crate::observer::{ListenerId, Listeners};
use crate::store::{Action, Notification, StateStore};
use crate::task::TaskSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    Active,
    Warning,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub os: String,
    pub arch: String,
    pub client: String,
}

impl DeviceInfo {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            client: format!("tabsync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub user_id: Option<String>,
    pub session_id: String,
    pub start_time: i64,
    pub last_activity_time: i64,
    pub is_active: bool,
    pub device_info: DeviceInfo,
}

struct Monitor {
    info: Option<SessionInfo>,
    phase: SessionPhase,
}

pub struct SessionMonitor {
    weak: Weak<SessionMonitor>,
    config: RwLock<SessionConfig>,
    clock: SharedClock,
    state: Arc<dyn StateStore>,
    monitor: Mutex<Monitor>,
    timer: TaskSlot,
    checker: TaskSlot,
    listeners: Listeners<SessionPhase>,
}

impl SessionMonitor {
    pub fn new(config: SessionConfig, clock: SharedClock, state: Arc<dyn StateStore>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config: RwLock::new(config),
            clock,
            state,
            monitor: Mutex::new(Monitor {
                info: None,
                phase: SessionPhase::Active,
            }),
            timer: TaskSlot::new(),
            checker: TaskSlot::new(),
            listeners: Listeners::new(),
        })
    }

    pub fn on_phase_change(
        &self,
        handler: impl Fn(&SessionPhase) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.add(handler)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn phase(&self) -> SessionPhase {
        self.monitor.lock().phase
    }

    pub fn info(&self) -> Option<SessionInfo> {
        self.monitor.lock().info.clone()
    }

    pub fn is_running(&self) -> bool {
        self.monitor.lock().info.is_some()
    }

    /// Begin monitoring with a fresh `SessionInfo`.
    pub fn start(&self, user_id: Option<String>) {
        let now = self.clock.now_ms();
        let info = SessionInfo {
            user_id,
            session_id: uuid::Uuid::new_v4().to_string(),
            start_time: now,
            last_activity_time: now,
            is_active: true,
            device_info: DeviceInfo::current(),
        };
        debug!("Session {} started", info.session_id);
        {
            let mut monitor = self.monitor.lock();
            monitor.info = Some(info);
            monitor.phase = SessionPhase::Active;
        }
        let config = self.config.read().clone();
        self.arm(config.warning_after());
        self.start_checker(config.check_interval());
    }

    pub fn stop(&self) {
        self.timer.cancel();
        self.checker.cancel();
        let mut monitor = self.monitor.lock();
        if let Some(info) = monitor.info.take() {
            debug!("Session {} stopped", info.session_id);
        }
        monitor.phase = SessionPhase::Active;
    }

    /// Restart monitoring under a new configuration.
    pub fn update_config(&self, config: SessionConfig) {
        *self.config.write() = config;
        let user_id = self.monitor.lock().info.as_ref().map(|i| i.user_id.clone());
        if let Some(user_id) = user_id {
            self.stop();
            self.start(user_id);
        }
    }

    /// A tracked user interaction. Resets ACTIVE/WARNING back to ACTIVE;
    /// ignored once expired or when not monitoring.
    pub fn record_activity(&self) -> bool {
        let now = self.clock.now_ms();
        let was_warning = {
            let mut monitor = self.monitor.lock();
            if monitor.phase == SessionPhase::Expired {
                return false;
            }
            let Some(info) = monitor.info.as_mut() else {
                return false;
            };
            info.last_activity_time = now;
            std::mem::replace(&mut monitor.phase, SessionPhase::Active) == SessionPhase::Warning
        };
        self.arm(self.config.read().warning_after());
        if was_warning {
            info!("Activity resumed, session active again");
            self.listeners.emit(&SessionPhase::Active);
        }
        true
    }

    /// Recompute the phase from elapsed inactivity and fire any transition
    /// that is due.
    pub fn check(&self) -> SessionPhase {
        let now = self.clock.now_ms();
        let config = self.config.read().clone();
        let warning_ms = config.warning_after().as_millis() as i64;
        let timeout_ms = config.timeout_after().as_millis() as i64;

        let (phase, transition, next_due) = {
            let mut monitor = self.monitor.lock();
            let current = monitor.phase;
            let Some(info) = monitor.info.as_mut() else {
                return current;
            };
            if current == SessionPhase::Expired {
                return current;
            }
            let idle = now - info.last_activity_time;
            if idle >= timeout_ms {
                info.is_active = false;
                monitor.phase = SessionPhase::Expired;
                (SessionPhase::Expired, true, None)
            } else if idle >= warning_ms {
                let remaining = Duration::from_millis((timeout_ms - idle) as u64);
                let entered = current == SessionPhase::Active;
                monitor.phase = SessionPhase::Warning;
                (SessionPhase::Warning, entered, Some(remaining))
            } else {
                (current, false, Some(Duration::from_millis((warning_ms - idle) as u64)))
            }
        };

        if let Some(due) = next_due {
            self.arm(due);
        }
        if transition {
            self.on_transition(phase, next_due);
        }
        phase
    }

    fn on_transition(&self, phase: SessionPhase, remaining: Option<Duration>) {
        match phase {
            SessionPhase::Warning => {
                let remaining_ms = remaining.map_or(0, |d| d.as_millis() as u64);
                warn!("Inactivity warning, session ends in {}s", remaining_ms / 1000);
                self.state.dispatch(Action::SessionWarning { remaining_ms });
                self.state.dispatch(Action::Notify(Notification::warning(format!(
                    "You will be signed out in {} minute(s) due to inactivity",
                    remaining_ms.div_ceil(60_000)
                ))));
            }
            SessionPhase::Expired => {
                info!("Session expired after inactivity");
                self.timer.cancel();
                self.checker.cancel();
            }
            SessionPhase::Active => {}
        }
        self.listeners.emit(&phase);
    }

    fn arm(&self, due: Duration) {
        let weak = self.weak.clone();
        self.timer.spawn(move |ticket| async move {
            tokio::time::sleep(due).await;
            if let Some(monitor) = weak.upgrade() {
                if monitor.timer.release(ticket) {
                    monitor.check();
                }
            }
        });
    }

    fn start_checker(&self, every: Duration) {
        if every.is_zero() {
            return;
        }
        let weak = self.weak.clone();
        self.checker.spawn(move |_| async move {
            loop {
                tokio::time::sleep(every).await;
                let Some(monitor) = weak.upgrade() else {
                    return;
                };
                if monitor.check() == SessionPhase::Expired {
                    return;
                }
            }
        });
    }
}

impl Drop for SessionMonitor {
    fn drop(&mut self) {
        self.timer.cancel();
        self.checker.cancel();
    }
}

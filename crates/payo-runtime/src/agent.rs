//! Wiring of the agent's components and background loops.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use payo_audit::TamperLog;
use payo_config::AgentConfig;
use payo_db::{CommandLedger, RegistrationStore};
use payo_enforce::{DeviceAdmin, DevicePolicy, EnforcementListener, Enforcer};
use payo_lock::{
    LockError, LockListener, LockRecord, LockState, LockStateManager, LockStore, PaymentPolicy,
    ScheduleStore,
};
use payo_tamper::{
    standard_collectors, CollectorSettings, DeviceProbe, Escalator, Observation, TamperCollector,
};
use payo_transport::HeartbeatTransport;

use crate::commands::CommandProcessor;
use crate::deactivation::{ConfirmSettings, DeactivationResult, DeactivationSequencer};
use crate::dispatcher::Dispatcher;
use crate::events::{AgentEvent, AgentNotice, TamperFlags};
use crate::CommandOutcome;
use crate::heartbeat::{DeviceInfo, HeartbeatLoop};
use crate::payment::{PaymentTracker, UnlockCodeError};
use crate::tasks::spawn_periodic;
use crate::watchdog::{Health, Watchdog};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const NOTICE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub collectors: CollectorSettings,
    pub heartbeat_interval: Duration,
    pub watchdog_interval: Duration,
    pub payment_interval: Duration,
    pub repeated_violation_limit: u32,
    pub violation_window: Duration,
    pub payment: PaymentPolicy,
    pub confirm: ConfirmSettings,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            collectors: CollectorSettings::default(),
            heartbeat_interval: Duration::from_secs(30),
            watchdog_interval: Duration::from_secs(5),
            payment_interval: Duration::from_secs(60),
            repeated_violation_limit: 3,
            violation_window: Duration::from_secs(3600),
            payment: PaymentPolicy::default(),
            confirm: ConfirmSettings::default(),
        }
    }
}

impl AgentSettings {
    /// `registered_sims` comes from the registration row, not config.
    pub fn from_config(cfg: &AgentConfig, registered_sims: &[String]) -> Self {
        let c = &cfg.collectors;
        Self {
            collectors: CollectorSettings {
                developer_options: Duration::from_secs(c.developer_options_secs),
                usb_debugging: Duration::from_secs(c.usb_debugging_secs),
                bootloader: Duration::from_secs(c.bootloader_secs),
                root: Duration::from_secs(c.root_secs),
                accessibility: Duration::from_secs(c.accessibility_secs),
                sim_change: Duration::from_secs(c.sim_change_secs),
                device_owner: Duration::from_secs(c.device_owner_secs),
                allowed_accessibility: cfg.allowed_accessibility_services.iter().cloned().collect(),
                registered_sims: registered_sims.iter().cloned().collect::<BTreeSet<_>>(),
            },
            heartbeat_interval: Duration::from_secs(cfg.heartbeat_interval_secs),
            watchdog_interval: Duration::from_secs(cfg.watchdog_interval_secs),
            payment_interval: Duration::from_secs(cfg.payment.check_interval_secs),
            repeated_violation_limit: cfg.escalation.repeated_violation_limit,
            violation_window: Duration::from_secs(cfg.escalation.violation_window_secs),
            payment: PaymentPolicy {
                soft_lock_hours_before_due: cfg.payment.soft_lock_hours_before_due,
                hard_lock_after_overdue_days: cfg.payment.hard_lock_after_overdue_days,
            },
            confirm: ConfirmSettings {
                attempts: cfg.deactivation.confirm_attempts,
                delay: Duration::from_millis(cfg.deactivation.confirm_delay_ms),
            },
        }
    }
}

/// Everything the agent needs from the outside world.
pub struct AgentDeps {
    pub device_id: String,
    pub probe: Arc<dyn DeviceProbe>,
    pub policy: Arc<dyn DevicePolicy>,
    pub admin: Arc<dyn DeviceAdmin>,
    pub info: Arc<dyn DeviceInfo>,
    pub lock_store: Arc<dyn LockStore>,
    pub schedule_store: Arc<dyn ScheduleStore>,
    pub ledger: Arc<dyn CommandLedger>,
    pub registration: Arc<dyn RegistrationStore>,
    pub transport: Arc<HeartbeatTransport>,
    pub tamper_log: Option<TamperLog>,
    /// Extra observers registered before boot (e.g. the UI bus).
    pub listeners: Vec<Arc<dyn LockListener>>,
}

/// Components with their loops not yet started. Useful for driving the agent
/// step by step.
pub struct Agent {
    pub manager: Arc<LockStateManager>,
    pub enforcer: Arc<Enforcer>,
    pub sequencer: Arc<DeactivationSequencer>,
    pub processor: Arc<CommandProcessor>,
    pub payment: Arc<PaymentTracker>,
    pub watchdog: Arc<Watchdog>,
    pub heartbeat: Arc<HeartbeatLoop>,
    pub transport: Arc<HeartbeatTransport>,
    pub flags: TamperFlags,
    pub notices: broadcast::Sender<AgentNotice>,
    pub boot_record: LockRecord,
    collectors: Vec<Arc<dyn TamperCollector>>,
    dispatcher: Option<Dispatcher>,
    settings: AgentSettings,
    shutdown: CancellationToken,
    monitoring: CancellationToken,
}

impl Agent {
    /// Build components and restore persisted lock state.
    pub async fn build(deps: AgentDeps, settings: AgentSettings) -> Result<Self, LockError> {
        let shutdown = CancellationToken::new();
        let monitoring = shutdown.child_token();

        let manager = Arc::new(LockStateManager::new(deps.lock_store));
        let enforcer = Arc::new(Enforcer::new(deps.policy));
        manager.add_listener(Arc::new(EnforcementListener::new(enforcer.clone())));
        for l in deps.listeners {
            manager.add_listener(l);
        }

        let boot_record = manager.boot().await?;
        if let Err(e) = deps.transport.resume().await {
            tracing::warn!(error = %e, "could not seed heartbeat clock from queue");
        }

        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let flags = TamperFlags::new();

        let payment = Arc::new(PaymentTracker::new(
            settings.payment,
            manager.clone(),
            deps.schedule_store,
        ));
        if let Err(e) = payment.restore().await {
            tracing::warn!(error = %e, "payment schedule not restored; waiting for backend");
        }

        let sequencer = Arc::new(DeactivationSequencer::new(
            deps.device_id.clone(),
            monitoring.clone(),
            enforcer.clone(),
            deps.admin.clone(),
            manager.clone(),
            deps.ledger.clone(),
            deps.registration,
            deps.transport.clone(),
            payment.clone(),
            settings.confirm,
        ));
        let processor = Arc::new(CommandProcessor::new(
            manager.clone(),
            deps.ledger.clone(),
            deps.admin.clone(),
            sequencer.clone(),
        ));
        let watchdog = Arc::new(
            Watchdog::new(
                deps.probe.clone(),
                enforcer.clone(),
                manager.clone(),
                deps.admin.clone(),
            )
            .with_sequencer(sequencer.clone()),
        );
        let heartbeat = Arc::new(HeartbeatLoop::new(
            deps.device_id.clone(),
            deps.transport.clone(),
            manager.clone(),
            deps.ledger,
            processor.clone(),
            payment.clone(),
            deps.info,
            flags.clone(),
        ));

        let mut dispatcher = Dispatcher::new(
            manager.clone(),
            Escalator::new(settings.repeated_violation_limit, settings.violation_window),
            flags.clone(),
        )
        .with_transport(deps.transport.clone())
        .with_notices(notices.clone());
        if let Some(log) = deps.tamper_log {
            dispatcher = dispatcher.with_tamper_log(log);
        }

        let collectors =
            standard_collectors(deps.probe, &deps.device_id, settings.collectors.clone());

        Ok(Self {
            manager,
            enforcer,
            sequencer,
            processor,
            payment,
            watchdog,
            heartbeat,
            transport: deps.transport,
            flags,
            notices,
            boot_record,
            collectors,
            dispatcher: Some(dispatcher),
            settings,
            shutdown,
            monitoring,
        })
    }

    /// Start background loops. A device that booted in `Deactivating`
    /// resumes the teardown instead of monitoring.
    pub fn start(mut self) -> AgentHandle {
        let mut tasks = Vec::new();

        if self.boot_record.state == LockState::Deactivating {
            tracing::warn!("interrupted deactivation found at boot; resuming");
            let sequencer = self.sequencer.clone();
            let notices = self.notices.clone();
            tasks.push(tokio::spawn(async move {
                let result = sequencer.deactivate().await;
                notify_deactivation(&notices, &result);
            }));
            return self.into_handle(tasks);
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        for c in &self.collectors {
            tasks.push(spawn_collector(c.clone(), tx.clone(), self.monitoring.clone()));
        }
        drop(tx);
        if let Some(dispatcher) = self.dispatcher.take() {
            tasks.push(tokio::spawn(dispatcher.run(rx, self.monitoring.clone())));
        }

        let heartbeat = self.heartbeat.clone();
        let notices = self.notices.clone();
        let transport = self.transport.clone();
        tasks.push(spawn_periodic(
            "heartbeat",
            self.settings.heartbeat_interval,
            self.monitoring.clone(),
            move || {
                let heartbeat = heartbeat.clone();
                let notices = notices.clone();
                let transport = transport.clone();
                async move {
                    let result = heartbeat.tick().await;
                    let queued = transport.queued_heartbeats().await.unwrap_or_default();
                    match &result {
                        Ok(tick) => {
                            for (_, outcome) in &tick.commands {
                                if let CommandOutcome::Deactivated(r) = outcome {
                                    notify_deactivation(&notices, r);
                                }
                            }
                            let _ = notices.send(AgentNotice::Heartbeat {
                                ts_millis: tick.timestamp_ms,
                                delivered: true,
                                queued_heartbeats: queued,
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "heartbeat not delivered");
                            let _ = notices.send(AgentNotice::Heartbeat {
                                ts_millis: chrono::Utc::now().timestamp_millis(),
                                delivered: false,
                                queued_heartbeats: queued,
                            });
                        }
                    }
                }
            },
        ));

        let watchdog = self.watchdog.clone();
        let notices = self.notices.clone();
        tasks.push(spawn_periodic(
            "watchdog",
            self.settings.watchdog_interval,
            self.monitoring.clone(),
            move || {
                let watchdog = watchdog.clone();
                let notices = notices.clone();
                async move {
                    if let Health::PrivilegeLost(p) = watchdog.verify().await {
                        let _ = notices.send(AgentNotice::Log {
                            level: "ERROR".to_string(),
                            msg: format!("{p}: lock={:?} wipe={:?}", p.lock, p.wipe),
                        });
                    }
                }
            },
        ));

        let payment = self.payment.clone();
        tasks.push(spawn_periodic(
            "payment",
            self.settings.payment_interval,
            self.monitoring.clone(),
            move || {
                let payment = payment.clone();
                async move {
                    payment.tick(chrono::Utc::now()).await;
                }
            },
        ));

        self.into_handle(tasks)
    }

    fn into_handle(self, tasks: Vec<JoinHandle<()>>) -> AgentHandle {
        AgentHandle {
            manager: self.manager,
            enforcer: self.enforcer,
            sequencer: self.sequencer,
            payment: self.payment,
            transport: self.transport,
            flags: self.flags,
            notices: self.notices,
            shutdown: self.shutdown,
            tasks,
        }
    }
}

fn notify_deactivation(notices: &broadcast::Sender<AgentNotice>, result: &DeactivationResult) {
    let (level, msg) = match result {
        DeactivationResult::Success(_) => ("INFO", "deactivation complete".to_string()),
        DeactivationResult::Failure { reason, .. } => ("ERROR", format!("deactivation failed: {reason}")),
        DeactivationResult::AlreadyInProgress => return,
    };
    let _ = notices.send(AgentNotice::Log {
        level: level.to_string(),
        msg,
    });
}

fn spawn_collector(
    collector: Arc<dyn TamperCollector>,
    tx: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let firing = Arc::new(AtomicBool::new(false));
    let name = collector.name();
    spawn_periodic(name, collector.cadence(), cancel, move || {
        let collector = collector.clone();
        let tx = tx.clone();
        let firing = firing.clone();
        async move {
            let probe = collector.clone();
            let observed = match tokio::task::spawn_blocking(move || probe.check()).await {
                Ok(o) => o,
                Err(e) => {
                    tracing::warn!(collector = collector.name(), error = %e, "collector check panicked");
                    return;
                }
            };
            // Unknown keeps the previous edge; only a successful negative read clears.
            let msg = match observed {
                Observation::Detected(ev) => {
                    firing.store(true, Ordering::SeqCst);
                    AgentEvent::Tamper(ev)
                }
                Observation::Clear if firing.swap(false, Ordering::SeqCst) => {
                    AgentEvent::Cleared(collector.kinds().to_vec())
                }
                Observation::Clear | Observation::Unknown => return,
            };
            if tx.send(msg).await.is_err() {
                tracing::debug!(collector = collector.name(), "dispatcher gone");
            }
        }
    })
}

/// Running agent.
pub struct AgentHandle {
    pub manager: Arc<LockStateManager>,
    pub enforcer: Arc<Enforcer>,
    pub sequencer: Arc<DeactivationSequencer>,
    pub payment: Arc<PaymentTracker>,
    pub transport: Arc<HeartbeatTransport>,
    pub flags: TamperFlags,
    pub notices: broadcast::Sender<AgentNotice>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<AgentNotice> {
        self.notices.subscribe()
    }

    pub async fn unlock_with_code(&self, code: &str) -> Result<LockState, UnlockCodeError> {
        self.payment.unlock_with_code(code).await
    }

    /// Stop every loop and wait for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for t in self.tasks {
            if let Err(e) = t.await {
                tracing::warn!(error = %e, "agent task ended abnormally");
            }
        }
    }
}

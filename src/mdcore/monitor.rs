//! Monitor loop (spec.md §4.6). Polls sysfs for state transitions, maps them
//! onto the event/priority table, and drives the configured alerting and
//! spare-migration actions.
//!
//! Daemonization follows the teacher's `main.rs`: `fork::Fork` to detach,
//! `nix::sys::signal` to install a handler that flips a shutdown flag rather
//! than terminating mid-poll.

use crate::mdcore::handler::{KernelRpc, SysfsTree};
use anyhow::Result;
use fork::{fork, Fork};
use log::{info, warn};
use nix::sys::signal::{self, SigHandler, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

/// Event vocabulary (spec.md §4.6 "Event set and priorities"), ordered by
/// the priority the monitor loop triages them in: a critical-tier event
/// always outranks a cosmetic info-tier one seen in the same poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Event {
    // info tier
    SpareActive = 0,
    NewArray = 1,
    MoveSpare = 2,
    TestMessage = 3,
    // warning tier
    RebuildStarted = 4,
    Rebuild = 5,
    RebuildFinished = 6,
    SparesMissing = 7,
    // critical tier
    DeviceDisappeared = 8,
    Fail = 9,
    FailSpare = 10,
    DegradedArray = 11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Info,
    Warning,
    Critical,
}

impl Event {
    fn parse(raw: &str) -> Option<Event> {
        match raw {
            "SpareActive" => Some(Event::SpareActive),
            "NewArray" => Some(Event::NewArray),
            "MoveSpare" => Some(Event::MoveSpare),
            "TestMessage" => Some(Event::TestMessage),
            "RebuildStarted" => Some(Event::RebuildStarted),
            "Rebuild" => Some(Event::Rebuild),
            "RebuildFinished" => Some(Event::RebuildFinished),
            "SparesMissing" => Some(Event::SparesMissing),
            "DeviceDisappeared" => Some(Event::DeviceDisappeared),
            "Fail" => Some(Event::Fail),
            "FailSpare" => Some(Event::FailSpare),
            "DegradedArray" => Some(Event::DegradedArray),
            _ => None,
        }
    }

    /// Syslog priority per the spec.md §4.6 table.
    pub fn priority(self) -> Priority {
        match self {
            Event::SpareActive | Event::NewArray | Event::MoveSpare | Event::TestMessage => Priority::Info,
            Event::RebuildStarted | Event::Rebuild | Event::RebuildFinished | Event::SparesMissing => Priority::Warning,
            Event::DeviceDisappeared | Event::Fail | Event::FailSpare | Event::DegradedArray => Priority::Critical,
        }
    }

    /// Whether this event is in the mail set (spec.md §4.6 table's "Mails?"
    /// column): every critical-tier event, plus `TestMessage` and
    /// `SparesMissing` from the lower tiers.
    pub fn mails(self) -> bool {
        match self.priority() {
            Priority::Critical => true,
            Priority::Warning => matches!(self, Event::SparesMissing),
            Priority::Info => matches!(self, Event::TestMessage),
        }
    }
}

/// Sorted, highest-priority-first view of one poll's raw event strings.
pub fn triage(raw_events: &[String]) -> Vec<Event> {
    let mut events: Vec<Event> = raw_events.iter().filter_map(|s| Event::parse(s)).collect();
    events.sort_by(|a, b| b.cmp(a));
    events
}

/// What to do about an event (spec.md §4.6 "Alerting actions"): exec an
/// external alert command, pipe a message to mail, and/or log to syslog.
/// Plain data so tests can assert on intent without touching a subprocess or
/// mail transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ExecAlertCommand { argv: Vec<String> },
    MailPipe { to: String, subject: String, body: String },
    Syslog { message: String, priority: Priority },
}

/// The three alerting actions are independent and may all fire for the same
/// event (spec.md §4.6): an alert command doesn't suppress mail, and neither
/// suppresses the syslog line at the event's table priority.
pub fn action_for(event: Event, devnm: &str, alert_command: Option<&str>, mail_to: Option<&str>) -> Vec<Action> {
    let message = format!("{:?} on {}", event, devnm);
    let mut actions = Vec::new();
    if let Some(cmd) = alert_command {
        actions.push(Action::ExecAlertCommand { argv: vec![cmd.to_string(), devnm.to_string(), format!("{:?}", event)] });
    }
    if event.mails() {
        if let Some(to) = mail_to {
            actions.push(Action::MailPipe { to: to.to_string(), subject: format!("mdcore alert: {:?}", event), body: message.clone() });
        }
    }
    actions.push(Action::Syslog { message, priority: event.priority() });
    actions
}

/// One polling pass over every tracked devnm: drain its events, triage them,
/// and return the actions to run, highest priority first across the whole
/// batch.
pub fn poll_once<S: SysfsTree>(sysfs: &mut S, devnms: &[String], alert_command: Option<&str>, mail_to: Option<&str>) -> Vec<(String, Action)> {
    let mut actions = Vec::new();
    for devnm in devnms {
        let raw = sysfs.poll_events(devnm);
        for event in triage(&raw) {
            for action in action_for(event, devnm, alert_command, mail_to) {
                actions.push((devnm.clone(), action));
            }
        }
    }
    actions
}

/// Spare migration across spare-groups (spec.md §4.6): when a container
/// drops a disk into `Fail`, any idle spare belonging to the same
/// spare-group is a candidate to move onto a degraded volume elsewhere in
/// the group. This just picks the candidate; moving it is a `KernelRpc`
/// `add_disk` call the caller issues with the result.
pub fn pick_spare_for_group<'a>(spare_group: &str, spares: &'a [(String, String)], needy_devnm: &str) -> Option<&'a str> {
    let _ = needy_devnm;
    spares.iter().find(|(group, _)| group == spare_group).map(|(_, devnm)| devnm.as_str())
}

pub fn migrate_spare<K: KernelRpc>(kernel: &mut K, source_devnm: &str, dest_devnm: &str, member_path: &str) -> Result<()> {
    kernel.remove_disk(source_devnm, member_path)?;
    kernel.add_disk(dest_devnm, member_path)?;
    Ok(())
}

/// Shared shutdown flag a `SIGTERM`/`SIGINT` handler flips; the poll loop
/// checks it between iterations instead of being killed mid-write the way an
/// unguarded daemon loop would be.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_shutdown_handler() -> Result<()> {
    unsafe {
        signal::signal(Signal::SIGTERM, SigHandler::Handler(request_shutdown))?;
        signal::signal(Signal::SIGINT, SigHandler::Handler(request_shutdown))?;
    }
    Ok(())
}

/// Daemonize and run the poll loop until `SHUTDOWN` is set, calling
/// `poll_fn` once per iteration. Returns immediately in the child; the
/// parent exits 0 right after a successful fork, matching the teacher's
/// `main.rs` detach pattern.
pub fn daemonize_and_run(poll_fn: impl Fn() -> Result<()>) -> Result<()> {
    match fork().map_err(|e| anyhow::anyhow!("fork failed: {:?}", e))? {
        Fork::Parent(_) => {
            info!("mdcore monitor daemonized");
            std::process::exit(0);
        }
        Fork::Child => {
            install_shutdown_handler()?;
            run_loop(poll_fn)
        }
    }
}

fn run_loop(poll_fn: impl Fn() -> Result<()>) -> Result<()> {
    while !SHUTDOWN.load(Ordering::SeqCst) {
        if let Err(e) = poll_fn() {
            warn!("monitor poll failed: {:#}", e);
        }
        std::thread::sleep(std::time::Duration::from_millis(250));
    }
    info!("monitor loop exiting on shutdown signal");
    Ok(())
}

/// Test-only handle to flip the shutdown flag without sending a real signal.
#[cfg(test)]
pub fn test_request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdcore::handler::FakeSysfsTree;

    #[test]
    fn triage_orders_fail_above_cosmetic_events() {
        let raw = vec!["RebuildFinished".to_string(), "Fail".to_string(), "DegradedArray".to_string()];
        let ordered = triage(&raw);
        assert_eq!(ordered[0], Event::DegradedArray);
        assert_eq!(*ordered.last().unwrap(), Event::RebuildFinished);
    }

    #[test]
    fn action_fires_exec_and_mail_and_syslog_independently() {
        let actions = action_for(Event::Fail, "md0", Some("/usr/sbin/mdadm-alert"), Some("ops@example.com"));
        assert!(actions.iter().any(|a| matches!(a, Action::ExecAlertCommand { .. })));
        assert!(actions.iter().any(|a| matches!(a, Action::MailPipe { .. })));
        assert!(actions.iter().any(|a| matches!(a, Action::Syslog { priority: Priority::Critical, .. })));
        assert_eq!(actions.len(), 3);
    }

    #[test]
    fn action_falls_back_to_mail_for_serious_events() {
        let actions = action_for(Event::DegradedArray, "md0", None, Some("ops@example.com"));
        assert_eq!(
            actions,
            vec![
                Action::MailPipe {
                    to: "ops@example.com".into(),
                    subject: "mdcore alert: DegradedArray".into(),
                    body: "DegradedArray on md0".into(),
                },
                Action::Syslog { message: "DegradedArray on md0".into(), priority: Priority::Critical },
            ]
        );
    }

    #[test]
    fn cosmetic_events_without_alert_command_stay_syslog_only() {
        let actions = action_for(Event::RebuildFinished, "md0", None, Some("ops@example.com"));
        assert_eq!(actions, vec![Action::Syslog { message: "RebuildFinished on md0".into(), priority: Priority::Warning }]);
    }

    #[test]
    fn spares_missing_mails_even_though_warning_tier() {
        assert!(Event::SparesMissing.mails());
        assert!(!Event::RebuildStarted.mails());
    }

    #[test]
    fn test_message_is_the_only_info_tier_event_that_mails() {
        assert!(Event::TestMessage.mails());
        assert!(!Event::SpareActive.mails());
    }

    #[test]
    fn poll_once_drains_events_across_devices() {
        let mut sysfs = FakeSysfsTree::new();
        sysfs.push_event("md0", "Fail");
        sysfs.push_event("md1", "RebuildFinished");
        let actions = poll_once(&mut sysfs, &["md0".into(), "md1".into()], None, None);
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn pick_spare_for_group_matches_group_name() {
        let spares = vec![("groupA".to_string(), "md10".to_string()), ("groupB".to_string(), "md11".to_string())];
        assert_eq!(pick_spare_for_group("groupB", &spares, "md3"), Some("md11"));
    }
}

//! Applies and removes a block set through a [`BlockProvider`].

use crate::config::BlockSet;
use crate::error::{KeyphyError, KeyphyResult};
use crate::provider::BlockProvider;
use log::{debug, info, warn};

/// Outcome of one apply or remove pass.
#[derive(Debug, Default)]
pub struct EnforcementReport {
    pub processed: usize,
    pub failures: Vec<KeyphyError>,
}

impl EnforcementReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(
        &mut self,
        action: &'static str,
        kind: &'static str,
        item: &str,
        result: KeyphyResult<()>,
    ) {
        self.processed += 1;
        match result {
            Ok(()) => debug!("{action} {kind} {item}"),
            Err(err) => {
                warn!("failed to {action} {kind} {item}: {err}");
                self.failures.push(KeyphyError::Enforcement {
                    action,
                    kind,
                    item: item.to_string(),
                    reason: err.to_string(),
                });
            }
        }
    }
}

/// Best-effort enforcement: a failing item is logged and the pass continues.
pub struct EnforcementService<P: BlockProvider> {
    provider: P,
}

impl<P: BlockProvider> EnforcementService<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Block every item of `blocks`: apps, websites, paths, then IPs.
    pub fn apply_blocks(&self, blocks: &BlockSet) -> EnforcementReport {
        let mut report = EnforcementReport::default();
        for app in &blocks.apps {
            report.record("block", "app", app, self.provider.block_app(app));
        }
        for domain in &blocks.websites {
            report.record("block", "website", domain, self.provider.block_website(domain));
        }
        for path in &blocks.paths {
            report.record("block", "path", path, self.provider.block_path(path));
        }
        for ip in &blocks.ips {
            report.record("block", "ip", ip, self.provider.block_ip(ip));
        }
        info!(
            "applied {} block(s), {} failure(s)",
            report.processed,
            report.failures.len()
        );
        report
    }

    /// Undo `blocks` and sweep any website or firewall state left behind.
    pub fn remove_all_blocks(&self, blocks: &BlockSet) -> EnforcementReport {
        let mut report = EnforcementReport::default();
        for domain in &blocks.websites {
            report.record("unblock", "website", domain, self.provider.unblock_website(domain));
        }
        report.record("unblock", "website", "*", self.provider.unblock_all_websites());
        report.record("unblock", "ip", "*", self.provider.unblock_all_ips());
        for app in &blocks.apps {
            report.record("unblock", "app", app, self.provider.unblock_app(app));
        }
        for path in &blocks.paths {
            report.record("unblock", "path", path, self.provider.unblock_path(path));
        }
        for ip in &blocks.ips {
            report.record("unblock", "ip", ip, self.provider.unblock_ip(ip));
        }
        info!(
            "removed {} block(s), {} failure(s)",
            report.processed,
            report.failures.len()
        );
        report
    }

    /// Kill processes of blocked apps that started since the last pass.
    pub fn terminate_blocked_processes(&self, blocks: &BlockSet) -> Vec<u32> {
        if blocks.apps.is_empty() {
            return Vec::new();
        }
        match self.provider.terminate_blocked_processes(&blocks.apps) {
            Ok(pids) => {
                if !pids.is_empty() {
                    info!("terminated blocked processes {pids:?}");
                }
                pids
            }
            Err(err) => {
                warn!("process sweep failed: {err}");
                Vec::new()
            }
        }
    }

    /// Verify blocking state; on a violation raise an alert and re-enforce.
    /// Returns whether a violation was found.
    pub fn verify_and_repair(&self) -> bool {
        match self.provider.verify_integrity() {
            Ok(()) => false,
            Err(err) => {
                warn!("SECURITY ALERT: {err}");
                if let Err(err) = self.provider.enforce_blocks() {
                    warn!("re-enforcement after integrity violation failed: {err}");
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockProvider {
        calls: Mutex<Vec<String>>,
        active: Mutex<BTreeSet<String>>,
        failing: Vec<String>,
        tampered: Mutex<bool>,
    }

    impl MockProvider {
        fn failing(items: &[&str]) -> Self {
            Self {
                failing: items.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }

        fn apply(&self, op: &str, kind: &str, item: &str, on: bool) -> KeyphyResult<()> {
            self.calls.lock().unwrap().push(format!("{op} {kind} {item}"));
            if self.failing.iter().any(|f| f == item) {
                return Err(KeyphyError::Provider(format!("{item} refused")));
            }
            let key = format!("{kind}:{item}");
            let mut active = self.active.lock().unwrap();
            if on {
                active.insert(key);
            } else {
                active.remove(&key);
            }
            Ok(())
        }

        fn clear_kind(&self, op: &str, kind: &str) -> KeyphyResult<()> {
            self.calls.lock().unwrap().push(format!("{op} {kind} *"));
            let prefix = format!("{kind}:");
            self.active.lock().unwrap().retain(|k| !k.starts_with(&prefix));
            Ok(())
        }

        fn active(&self) -> BTreeSet<String> {
            self.active.lock().unwrap().clone()
        }
    }

    impl BlockProvider for MockProvider {
        fn block_app(&self, app: &str) -> KeyphyResult<()> {
            self.apply("block", "app", app, true)
        }
        fn unblock_app(&self, app: &str) -> KeyphyResult<()> {
            self.apply("unblock", "app", app, false)
        }
        fn block_website(&self, domain: &str) -> KeyphyResult<()> {
            self.apply("block", "website", domain, true)
        }
        fn unblock_website(&self, domain: &str) -> KeyphyResult<()> {
            self.apply("unblock", "website", domain, false)
        }
        fn unblock_all_websites(&self) -> KeyphyResult<()> {
            self.clear_kind("unblock", "website")
        }
        fn block_path(&self, path: &str) -> KeyphyResult<()> {
            self.apply("block", "path", path, true)
        }
        fn unblock_path(&self, path: &str) -> KeyphyResult<()> {
            self.apply("unblock", "path", path, false)
        }
        fn block_ip(&self, ip: &str) -> KeyphyResult<()> {
            self.apply("block", "ip", ip, true)
        }
        fn unblock_ip(&self, ip: &str) -> KeyphyResult<()> {
            self.apply("unblock", "ip", ip, false)
        }
        fn unblock_all_ips(&self) -> KeyphyResult<()> {
            self.clear_kind("unblock", "ip")
        }
        fn terminate_blocked_processes(&self, apps: &[String]) -> KeyphyResult<Vec<u32>> {
            Ok(apps.iter().enumerate().map(|(i, _)| 100 + i as u32).collect())
        }
        fn verify_integrity(&self) -> KeyphyResult<()> {
            if *self.tampered.lock().unwrap() {
                return Err(KeyphyError::IntegrityViolation("firefox replaced".into()));
            }
            Ok(())
        }
        fn enforce_blocks(&self) -> KeyphyResult<()> {
            self.calls.lock().unwrap().push("enforce".into());
            *self.tampered.lock().unwrap() = false;
            Ok(())
        }
    }

    fn blocks() -> BlockSet {
        BlockSet {
            apps: vec!["firefox".into()],
            websites: vec!["example.com".into()],
            paths: vec!["/home/user/games".into()],
            ips: vec!["203.0.113.7".into()],
        }
    }

    #[test]
    fn apply_follows_category_order() {
        let service = EnforcementService::new(MockProvider::default());
        let report = service.apply_blocks(&blocks());
        assert!(report.is_clean());
        assert_eq!(report.processed, 4);
        assert_eq!(
            *service.provider().calls.lock().unwrap(),
            vec![
                "block app firefox",
                "block website example.com",
                "block path /home/user/games",
                "block ip 203.0.113.7",
            ]
        );
    }

    #[test]
    fn apply_twice_matches_apply_once() {
        let service = EnforcementService::new(MockProvider::default());
        service.apply_blocks(&blocks());
        let once = service.provider().active();
        service.apply_blocks(&blocks());
        assert_eq!(service.provider().active(), once);
        assert_eq!(once.len(), 4);
    }

    #[test]
    fn failures_are_collected_and_do_not_stop_the_pass() {
        let service = EnforcementService::new(MockProvider::failing(&["example.com"]));
        let report = service.apply_blocks(&blocks());
        assert_eq!(report.processed, 4);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            &report.failures[0],
            KeyphyError::Enforcement { kind: "website", item, .. } if item == "example.com"
        ));
        assert!(service.provider().active().contains("ip:203.0.113.7"));
    }

    #[test]
    fn remove_sweeps_websites_and_ips_before_apps() {
        let service = EnforcementService::new(MockProvider::default());
        service.apply_blocks(&blocks());
        service.provider().calls.lock().unwrap().clear();

        let report = service.remove_all_blocks(&blocks());
        assert!(report.is_clean());
        assert!(service.provider().active().is_empty());
        assert_eq!(
            *service.provider().calls.lock().unwrap(),
            vec![
                "unblock website example.com",
                "unblock website *",
                "unblock ip *",
                "unblock app firefox",
                "unblock path /home/user/games",
                "unblock ip 203.0.113.7",
            ]
        );
    }

    #[test]
    fn terminate_skips_provider_without_apps() {
        let service = EnforcementService::new(MockProvider::default());
        assert!(service.terminate_blocked_processes(&BlockSet::default()).is_empty());
        assert_eq!(service.terminate_blocked_processes(&blocks()), vec![100]);
    }

    #[test]
    fn integrity_violation_triggers_reenforcement() {
        let service = EnforcementService::new(MockProvider::default());
        assert!(!service.verify_and_repair());
        *service.provider().tampered.lock().unwrap() = true;
        assert!(service.verify_and_repair());
        assert_eq!(*service.provider().calls.lock().unwrap(), vec!["enforce"]);
        assert!(!service.verify_and_repair());
    }
}

//! Drives reconciliation passes and the shutdown teardown.

use std::{path::PathBuf, time::Duration};

use anyhow::bail;
use tokio::{
    signal::unix::{signal, SignalKind},
    task::{self, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vipgate_kernel::Backend;

use crate::{reconciler::Reconciler, snapshot::MappingSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One apply pass.
    Once,
    /// One teardown pass that also removes the classifying chain.
    Delete,
    /// Apply passes every interval until cancelled, then a delete pass.
    Periodic(Duration),
}

/// Where the two mappings are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingDirs {
    pub workload_to_vip: PathBuf,
    pub vip_to_route_id: PathBuf,
}

impl MappingDirs {
    pub fn load(&self) -> MappingSnapshot {
        MappingSnapshot::load(&self.workload_to_vip, &self.vip_to_route_id)
    }
}

/// Runs `f` on the blocking pool and hands the reconciler back.
async fn blocking<B, T, F>(reconciler: Reconciler<B>, f: F) -> anyhow::Result<(Reconciler<B>, T)>
where
    B: Backend + 'static,
    T: Send + 'static,
    F: FnOnce(&mut Reconciler<B>) -> T + Send + 'static,
{
    let res = task::spawn_blocking(move || {
        let mut reconciler = reconciler;
        let out = f(&mut reconciler);
        (reconciler, out)
    })
    .await?;

    Ok(res)
}

pub async fn run<B: Backend + 'static>(
    reconciler: Reconciler<B>,
    dirs: MappingDirs,
    mode: Mode,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let (mut reconciler, found) = blocking(reconciler, |r| {
        let interface = r.settings().interface.clone();
        r.backend().link_exists(&interface)
    })
    .await?;

    if !found? {
        bail!("interface {} not found", reconciler.settings().interface);
    }

    match mode {
        Mode::Once => {
            let (_, report) = blocking(reconciler, move |r| r.reconcile(dirs.load())).await?;
            report?;
        }
        Mode::Delete => {
            let (_, report) = blocking(reconciler, move |r| r.delete(&dirs.load())).await?;
            report?;
        }
        Mode::Periodic(interval) => {
            info!(interval = %humantime::format_duration(interval), "starting periodic reconciliation");

            while !cancel.is_cancelled() {
                let pass_dirs = dirs.clone();
                let (r, report) = blocking(reconciler, move |r| r.reconcile(pass_dirs.load())).await?;
                reconciler = r;
                report?;

                tokio::select! {
                    _ = cancel.cancelled() => {},
                    _ = tokio::time::sleep(interval) => debug!("next cycle"),
                }
            }

            info!("termination requested, removing managed state");
            let (_, report) = blocking(reconciler, move |r| r.delete(&dirs.load())).await?;
            report?;
        }
    }

    Ok(())
}

/// Cancels `cancel` on SIGTERM or SIGINT.
pub fn cancel_on_signal(cancel: CancellationToken) -> anyhow::Result<JoinHandle<()>> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => info!("captured SIGTERM"),
            _ = interrupt.recv() => info!("captured SIGINT"),
        }
        cancel.cancel();
    }))
}

/// Installs [`cancel_on_signal`] for the periodic mode only. The single-pass
/// modes keep the default disposition so SIGINT still stops a stuck pass.
pub fn watch_signals(mode: Mode, cancel: &CancellationToken) -> anyhow::Result<Option<JoinHandle<()>>> {
    match mode {
        Mode::Periodic(_) => Ok(Some(cancel_on_signal(cancel.clone())?)),
        Mode::Once | Mode::Delete => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, net::Ipv4Addr, sync::Arc};

    use tempfile::TempDir;
    use vipgate_kernel::{memory::MemoryBackend, Table};

    use crate::settings::Settings;

    use super::*;

    const VIP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);

    struct Fixture {
        _workloads: TempDir,
        _route_ids: TempDir,
        dirs: MappingDirs,
        backend: Arc<MemoryBackend>,
    }

    impl Fixture {
        fn new(addrs: &[Ipv4Addr]) -> Self {
            let workloads = tempfile::tempdir().unwrap();
            let route_ids = tempfile::tempdir().unwrap();
            fs::write(workloads.path().join("10.32.0.5"), "203.0.113.10\n").unwrap();
            fs::write(route_ids.path().join("203.0.113.10"), "100\n").unwrap();

            let dirs = MappingDirs {
                workload_to_vip: workloads.path().to_owned(),
                vip_to_route_id: route_ids.path().to_owned(),
            };

            Self {
                _workloads: workloads,
                _route_ids: route_ids,
                dirs,
                backend: Arc::new(MemoryBackend::new().with_link("eth0", addrs.iter().copied())),
            }
        }

        fn reconciler(&self) -> Reconciler<Arc<MemoryBackend>> {
            let settings = Settings::new(
                "eth0",
                "10.32.0.0/12".parse().unwrap(),
                "10.96.0.0/12".parse().unwrap(),
            );
            Reconciler::new(self.backend.clone(), settings)
        }

        fn is_clean(&self) -> bool {
            self.backend.state() == MemoryBackend::new().state()
        }
    }

    #[tokio::test]
    async fn signals_watched_in_periodic_mode_only() {
        let cancel = CancellationToken::new();

        assert!(watch_signals(Mode::Once, &cancel).unwrap().is_none());
        assert!(watch_signals(Mode::Delete, &cancel).unwrap().is_none());

        let handle = watch_signals(Mode::Periodic(Duration::from_secs(30)), &cancel)
            .unwrap()
            .unwrap();
        handle.abort();
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn run_once_applies() {
        let fixture = Fixture::new(&[VIP]);

        run(
            fixture.reconciler(),
            fixture.dirs.clone(),
            Mode::Once,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let state = fixture.backend.state();
        assert_eq!(state.rules(Table::Nat, "POSTROUTING").len(), 1);
        assert_eq!(state.rules(Table::Mangle, "PREROUTING").len(), 1);
    }

    #[tokio::test]
    async fn delete_mode_removes_everything() {
        let fixture = Fixture::new(&[]);

        run(
            fixture.reconciler(),
            fixture.dirs.clone(),
            Mode::Once,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!fixture.is_clean());

        run(
            fixture.reconciler(),
            fixture.dirs.clone(),
            Mode::Delete,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(fixture.is_clean());
    }

    #[tokio::test]
    async fn missing_interface_is_fatal() {
        let fixture = Fixture::new(&[]);
        let settings = Settings::new(
            "eth9",
            "10.32.0.0/12".parse().unwrap(),
            "10.96.0.0/12".parse().unwrap(),
        );

        let res = run(
            Reconciler::new(fixture.backend.clone(), settings),
            fixture.dirs.clone(),
            Mode::Once,
            CancellationToken::new(),
        )
        .await;

        assert!(res.unwrap_err().to_string().contains("eth9"));
        assert!(fixture.backend.journal().is_empty());
    }

    #[tokio::test]
    async fn periodic_tears_down_when_cancelled() {
        let fixture = Fixture::new(&[]);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run(
            fixture.reconciler(),
            fixture.dirs.clone(),
            Mode::Periodic(Duration::from_secs(3600)),
            cancel.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while fixture.backend.state().selectors.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(fixture.is_clean());
        assert!(fixture
            .backend
            .journal()
            .iter()
            .any(|entry| entry == "remove chain mangle/VIPGATE-EGRESS"));
    }

    #[tokio::test]
    async fn periodic_picks_up_mapping_changes() {
        let fixture = Fixture::new(&[VIP]);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run(
            fixture.reconciler(),
            fixture.dirs.clone(),
            Mode::Periodic(Duration::from_millis(20)),
            cancel.clone(),
        ));

        fs::write(fixture.dirs.workload_to_vip.join("10.32.0.6"), "203.0.113.10").unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while fixture
                .backend
                .state()
                .rules(Table::Mangle, "FORWARD")
                .iter()
                .all(|rule| rule.sources.len() != 2)
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(fixture.is_clean());
    }
}

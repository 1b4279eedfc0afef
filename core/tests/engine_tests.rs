/// End-to-end tests for the operation scheduler.
/// Every external tool is a small shell script in a temp directory, so no
/// real device is ever touched.

#[cfg(unix)]
mod engine_tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use wipekit_core::test_utils::{MockDevice, MockProbe};
    use wipekit_core::{EngineConfig, OperationRequest, OperationScheduler, Outcome, ProgressEvent};

    const MIB: u64 = 1 << 20;

    /// Fake dd: logs "<pid> <if>" per invocation to <logs>/<device>.dd,
    /// reports progress in two steps and exits 0. Devices whose name
    /// contains "slow" hang until killed, "stubborn" ones also ignore
    /// SIGTERM, "full" ones run out of space, and "hang2" ones hang from
    /// their second pass on.
    const FAKE_DD: &str = r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    if=*) src="${arg#if=}" ;;
    of=*) dev="${arg#of=}" ;;
  esac
done
log="$LOGS/$(basename "$dev").dd"
echo "$$ $src" >> "$log"
passes=$(wc -l < "$log")
case "$dev" in
  *slow*) exec sleep 30 ;;
  *stubborn*) trap '' TERM; exec sleep 30 ;;
  *hang2*) if [ "$passes" -ge 2 ]; then exec sleep 30; fi ;;
esac
printf '524288 bytes (524 kB, 512 KiB) copied, 0.1 s, 5.2 MB/s\r' >&2
printf '1048576 bytes (1.0 MB, 1.0 MiB) copied, 0.2 s, 5.2 MB/s\n' >&2
case "$dev" in
  *full*)
    echo "dd: error writing '$dev': No space left on device" >&2
    echo "2+0 records in" >&2
    echo "1+0 records out" >&2
    exit 1 ;;
esac
echo "2+0 records in" >&2
echo "2+0 records out" >&2
exit 0
"#;

    /// Fake parted: logs its arguments; fails mkpart on "badpart" devices
    /// and hangs on "hangpart" ones, logging its pid to parted.pid.
    const FAKE_PARTED: &str = r#"#!/bin/sh
echo "$*" >> "$LOGS/parted"
case "$1" in
  *badpart*) if [ "$3" = "mkpart" ]; then echo "Error: Can't create partition" >&2; exit 1; fi ;;
  *hangpart*) echo "$$" >> "$LOGS/parted.pid"; exec sleep 30 ;;
esac
exit 0
"#;

    /// Fake mkfs: logs its name and arguments. Hangs on "hangfs"
    /// partitions, logging its pid to mkfs.pid.
    const FAKE_MKFS: &str = r#"#!/bin/sh
echo "$(basename "$0") $*" >> "$LOGS/mkfs"
case "$*" in
  *hangfs*) echo "$$" >> "$LOGS/mkfs.pid"; exec sleep 30 ;;
esac
echo "Writing superblocks and filesystem accounting information: done"
exit 0
"#;

    struct Workspace {
        dir: TempDir,
    }

    impl Workspace {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("Failed to create temp dir");
            fs::create_dir(dir.path().join("logs")).expect("Failed to create log dir");
            let ws = Self { dir };
            ws.script("dd", FAKE_DD);
            ws.script("parted", FAKE_PARTED);
            for mkfs in ["mkfs.ext4", "mkfs.ntfs", "mkfs.fat", "mkfs.exfat"] {
                ws.script(mkfs, FAKE_MKFS);
            }
            ws
        }

        fn logs(&self) -> PathBuf {
            self.dir.path().join("logs")
        }

        /// Scripts read $LOGS, so bake the path in rather than touching
        /// the test process environment.
        fn script(&self, name: &str, body: &str) {
            let path = self.dir.path().join(name);
            let body = body.replacen(
                "#!/bin/sh\n",
                &format!("#!/bin/sh\nLOGS='{}'\n", self.logs().display()),
                1,
            );
            fs::write(&path, body).expect("Failed to write script");
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("Failed to chmod script");
        }

        fn tool(&self, name: &str) -> String {
            self.dir.path().join(name).display().to_string()
        }

        fn config(&self) -> EngineConfig {
            let mut config = EngineConfig::default();
            config.tools.dd = self.tool("dd");
            config.tools.parted = self.tool("parted");
            config.tools.mkfs_ext4 = self.tool("mkfs.ext4");
            config.tools.mkfs_ntfs = self.tool("mkfs.ntfs");
            config.tools.mkfs_fat = self.tool("mkfs.fat");
            config.tools.mkfs_exfat = self.tool("mkfs.exfat");
            config.format_poll_interval_ms = 50;
            config.terminate_grace_ms = 2000;
            config.partition_settle_timeout_ms = 500;
            config
        }

        fn read_log(&self, name: &str) -> Vec<String> {
            read_lines(&self.logs().join(name))
        }

        fn dd_log(&self, device: &str) -> Vec<String> {
            let name = Path::new(device)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            self.read_log(&format!("{}.dd", name))
        }

        async fn wait_for_dd_runs(&self, device: &str, count: usize) {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            while self.dd_log(device).len() < count {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "dd never reached run {} on {}",
                    count,
                    device
                );
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        /// Wait for a hanging tool to log its pid.
        async fn wait_for_pid(&self, name: &str) -> u32 {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            loop {
                if let Some(pid) = self.read_log(name).first().and_then(|p| p.trim().parse().ok()) {
                    return pid;
                }
                assert!(tokio::time::Instant::now() < deadline, "nothing ever wrote {}", name);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn probe() -> MockProbe {
        MockProbe::new().with_root("/dev/sda2").with_device("/dev/sda", 500 * MIB)
    }

    fn events_for<'a>(events: &'a [ProgressEvent], device: &str) -> Vec<&'a ProgressEvent> {
        events.iter().filter(|e| e.device == device).collect()
    }

    fn assert_monotonic(events: &[&ProgressEvent]) {
        let mut previous = 0;
        for event in events {
            assert!(event.percentage <= 100, "{:?} is out of range", event);
            assert!(
                event.percentage >= previous,
                "progress went backwards: {} after {} ({})",
                event.percentage,
                previous,
                event.status
            );
            previous = event.percentage;
        }
    }

    fn pid_alive(pid: u32) -> bool {
        Path::new(&format!("/proc/{}", pid)).exists()
    }

    #[tokio::test]
    async fn test_mixed_batch_end_to_end() {
        let ws = Workspace::new();
        let probe = probe()
            .with_mounted("/dev/fakemounted", MIB, "/media/usb")
            .with_device("/dev/fakezero", MIB)
            .with_device("/dev/fakeodd", MIB);
        let scheduler = OperationScheduler::new(&ws.config(), Arc::new(probe));

        let mut batch = scheduler
            .submit_batch(vec![
                OperationRequest::wipe("/dev/fakemounted", "zero"),
                OperationRequest::wipe("/dev/fakezero", "zero"),
                OperationRequest::format("/dev/fakeodd", "reiserfs", None),
            ])
            .await;

        let mut events = Vec::new();
        while let Some(event) = batch.next_progress().await {
            events.push(event);
        }
        let results = batch.wait().await;

        assert_eq!(results.len(), 3, "one result per submitted device");

        assert_eq!(results[0].device, "/dev/fakemounted");
        assert!(results[0].reason().unwrap_or_default().contains("mounted"));

        assert_eq!(results[1].device, "/dev/fakezero");
        assert_eq!(
            results[1].outcome,
            Outcome::Success {
                details: "Successfully wiped /dev/fakezero using zero method".to_string()
            }
        );
        assert_eq!(ws.dd_log("/dev/fakezero").len(), 1, "zero method is a single pass");

        assert_eq!(results[2].device, "/dev/fakeodd");
        assert!(results[2].reason().unwrap_or_default().contains("Unsupported filesystem"));
        assert!(ws.read_log("parted").is_empty(), "no partition command may run");

        let zero_events = events_for(&events, "/dev/fakezero");
        assert_monotonic(&zero_events);
        assert_eq!(zero_events.last().map(|e| e.percentage), Some(100));
        assert!(zero_events.iter().all(|e| e.total_devices == Some(3)));
        assert!(events_for(&events, "/dev/fakemounted").is_empty());
        assert!(ws.dd_log("/dev/fakemounted").is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_second_dod_pass() {
        let ws = Workspace::new();
        let device = "/dev/fakehang2";
        let scheduler = OperationScheduler::new(&ws.config(), Arc::new(probe().with_device(device, MIB)));

        let batch = scheduler.submit_batch(vec![OperationRequest::wipe(device, "dod")]).await;
        ws.wait_for_dd_runs(device, 2).await;
        // Give the runner a moment to start streaming the second pass.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.progress_of(device).unwrap_or(0) >= 33);

        scheduler.cancel(device).expect("operation should be registered");
        let results = batch.wait().await;

        assert_eq!(results.len(), 1);
        assert!(results[0].is_cancelled(), "got {:?}", results[0]);

        let runs = ws.dd_log(device);
        assert_eq!(runs.len(), 2, "third pass must never start: {:?}", runs);
        let pid: u32 = runs[1]
            .split_whitespace()
            .next()
            .and_then(|p| p.parse().ok())
            .expect("pid logged");
        assert!(!pid_alive(pid), "pass 2 process {} still running", pid);
        assert!(scheduler.active_devices().is_empty());
    }

    #[tokio::test]
    async fn test_cancelling_one_device_leaves_other_untouched() {
        let ws = Workspace::new();
        let probe = probe().with_device("/dev/fakeslow", MIB).with_device("/dev/fakefast", MIB);
        let scheduler = OperationScheduler::new(&ws.config(), Arc::new(probe));

        let mut batch = scheduler
            .submit_batch(vec![
                OperationRequest::wipe("/dev/fakeslow", "random"),
                OperationRequest::wipe("/dev/fakefast", "dod"),
            ])
            .await;

        ws.wait_for_dd_runs("/dev/fakeslow", 1).await;
        scheduler.cancel("/dev/fakeslow").expect("slow device registered");

        let mut events = Vec::new();
        while let Some(event) = batch.next_progress().await {
            events.push(event);
        }
        let results = batch.wait().await;

        assert!(results[0].is_cancelled(), "got {:?}", results[0]);
        assert!(results[1].is_success(), "got {:?}", results[1]);
        assert_eq!(ws.dd_log("/dev/fakefast").len(), 3);

        let fast = events_for(&events, "/dev/fakefast");
        assert_monotonic(&fast);
        assert_eq!(fast.last().map(|e| e.percentage), Some(100));
    }

    #[tokio::test]
    async fn test_out_of_space_counts_as_success() {
        let ws = Workspace::new();
        let device = "/dev/fakefull";
        let scheduler = OperationScheduler::new(&ws.config(), Arc::new(probe().with_device(device, MIB)));

        let results = scheduler
            .submit_batch(vec![OperationRequest::wipe(device, "zero")])
            .await
            .wait()
            .await;

        assert!(results[0].is_success(), "got {:?}", results[0]);
    }

    #[tokio::test]
    async fn test_out_of_space_fails_when_rule_disabled() {
        let ws = Workspace::new();
        let device = "/dev/fakefull";
        let mut config = ws.config();
        config.exit_policy.out_of_space = None;
        let scheduler = OperationScheduler::new(&config, Arc::new(probe().with_device(device, MIB)));

        let results = scheduler
            .submit_batch(vec![OperationRequest::wipe(device, "zero")])
            .await
            .wait()
            .await;

        let reason = results[0].reason().unwrap_or_default();
        assert!(reason.contains("pass 1/1"), "unexpected reason: {}", reason);
        assert!(reason.contains("No space left on device"), "unexpected reason: {}", reason);
    }

    #[tokio::test]
    async fn test_format_runs_all_stages() {
        let ws = Workspace::new();
        let probe = probe().with_device("/dev/fakefmt", 64 * MIB);
        probe.insert("/dev/fakefmt1", MockDevice { size: 64 * MIB, ..Default::default() });
        let scheduler = OperationScheduler::new(&ws.config(), Arc::new(probe));

        let mut batch = scheduler
            .submit_batch(vec![OperationRequest::format("/dev/fakefmt", "FAT32", Some("BACKUP".to_string()))])
            .await;
        let mut events = Vec::new();
        while let Some(event) = batch.next_progress().await {
            events.push(event);
        }
        let results = batch.wait().await;

        assert_eq!(
            results[0].outcome,
            Outcome::Success {
                details: "Successfully formatted /dev/fakefmt as fat32 with label \"BACKUP\"".to_string()
            }
        );
        assert_eq!(
            ws.read_log("parted"),
            vec![
                "/dev/fakefmt --script mklabel gpt".to_string(),
                "/dev/fakefmt --script mkpart primary 0% 100%".to_string(),
            ]
        );
        assert_eq!(ws.read_log("mkfs"), vec!["mkfs.fat -F 32 /dev/fakefmt1 -n BACKUP".to_string()]);

        let percentages: Vec<u8> = events.iter().map(|e| e.percentage).collect();
        for milestone in [10, 30, 50, 100] {
            assert!(percentages.contains(&milestone), "missing {}% in {:?}", milestone, percentages);
        }
        assert_monotonic(&events.iter().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failed_partition_stage_stops_format() {
        let ws = Workspace::new();
        let scheduler = OperationScheduler::new(&ws.config(), Arc::new(probe().with_device("/dev/fakebadpart", MIB)));

        let results = scheduler
            .submit_batch(vec![OperationRequest::format("/dev/fakebadpart", "ext4", None)])
            .await
            .wait()
            .await;

        let reason = results[0].reason().unwrap_or_default();
        assert!(reason.contains("creating partition"), "unexpected reason: {}", reason);
        assert!(reason.contains("Can't create partition"), "unexpected reason: {}", reason);
        assert!(ws.read_log("mkfs").is_empty(), "mkfs must not run after a failed stage");
    }

    #[tokio::test]
    async fn test_cancel_while_creating_filesystem() {
        let ws = Workspace::new();
        let device = "/dev/fakehangfs";
        let probe = probe().with_device(device, 64 * MIB);
        probe.insert("/dev/fakehangfs1", MockDevice { size: 64 * MIB, ..Default::default() });
        let scheduler = OperationScheduler::new(&ws.config(), Arc::new(probe));

        let mut batch = scheduler
            .submit_batch(vec![OperationRequest::format(device, "ext4", None)])
            .await;
        let pid = ws.wait_for_pid("mkfs.pid").await;
        assert!(pid_alive(pid));

        scheduler.cancel(device).expect("format registered");

        let mut events = Vec::new();
        while let Some(event) = batch.next_progress().await {
            events.push(event);
        }
        let results = batch.wait().await;

        assert!(results[0].is_cancelled(), "cancel must not surface as an error: {:?}", results[0]);
        assert!(!pid_alive(pid), "mkfs process {} still running", pid);
        assert_eq!(ws.read_log("parted").len(), 2, "both partitioning stages ran");
        assert!(events.iter().all(|e| e.percentage < 100), "cancelled format reported completion");
        assert!(scheduler.active_devices().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_after_wipe_stops_format() {
        let ws = Workspace::new();
        let device = "/dev/fakehangpart";
        let scheduler = OperationScheduler::new(&ws.config(), Arc::new(probe().with_device(device, MIB)));

        let mut batch = scheduler
            .submit_batch(vec![OperationRequest::wipe_then_format(device, "zero", "ext4", None)])
            .await;
        let pid = ws.wait_for_pid("parted.pid").await;
        scheduler.cancel(device).expect("operation registered");

        let mut events = Vec::new();
        while let Some(event) = batch.next_progress().await {
            events.push(event);
        }
        let results = batch.wait().await;

        assert!(results[0].is_cancelled(), "got {:?}", results[0]);
        assert!(!pid_alive(pid), "parted process {} still running", pid);
        assert_eq!(ws.dd_log(device).len(), 1, "wipe finished before the cancel");
        assert!(
            events.iter().any(|e| e.status == "Wipe completed successfully"),
            "wipe completion reported"
        );
        assert_eq!(
            ws.read_log("parted"),
            vec![format!("{} --script mklabel gpt", device)],
            "no stage may start after the cancel"
        );
        assert!(ws.read_log("mkfs").is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_device_stays_reserved_until_process_exits() {
        let ws = Workspace::new();
        let device = "/dev/fakestubborn";
        let scheduler = OperationScheduler::new(&ws.config(), Arc::new(probe().with_device(device, MIB)));

        let first = scheduler.submit_batch(vec![OperationRequest::wipe(device, "zero")]).await;
        ws.wait_for_dd_runs(device, 1).await;
        let pid: u32 = ws.dd_log(device)[0]
            .split_whitespace()
            .next()
            .and_then(|p| p.parse().ok())
            .expect("pid logged");

        scheduler.cancel(device).expect("cancel reports success");
        assert!(scheduler.active_devices().is_empty());
        assert!(scheduler.cancel(device).is_err(), "already cancelled");

        // The old dd ignores SIGTERM and is still running for the grace period.
        assert!(pid_alive(pid));
        let second = scheduler
            .submit_batch(vec![OperationRequest::wipe(device, "zero")])
            .await
            .wait()
            .await;
        let reason = second[0].reason().unwrap_or_default();
        assert!(reason.contains("already in progress"), "second writer accepted: {:?}", second[0]);
        assert_eq!(ws.dd_log(device).len(), 1, "no second dd was started");

        let results = first.wait().await;
        assert!(results[0].is_cancelled(), "got {:?}", results[0]);
        assert!(!pid_alive(pid), "dd {} survived the kill", pid);
        assert!(scheduler.cancel(device).is_err(), "device released");
    }

    #[tokio::test]
    async fn test_wipe_then_format() {
        let ws = Workspace::new();
        let probe = probe().with_device("/dev/fakeboth", MIB);
        probe.insert("/dev/fakeboth1", MockDevice { size: MIB, ..Default::default() });
        let scheduler = OperationScheduler::new(&ws.config(), Arc::new(probe));

        let mut batch = scheduler
            .submit_batch(vec![OperationRequest::wipe_then_format("/dev/fakeboth", "zero", "ext4", None)])
            .await;
        let mut events = Vec::new();
        while let Some(event) = batch.next_progress().await {
            events.push(event);
        }
        let results = batch.wait().await;

        assert!(results[0].is_success(), "got {:?}", results[0]);
        assert_eq!(ws.dd_log("/dev/fakeboth").len(), 1);
        assert_eq!(ws.read_log("mkfs"), vec!["mkfs.ext4 -F /dev/fakeboth1".to_string()]);

        assert_monotonic(&events.iter().collect::<Vec<_>>());
        let wipe_done = events
            .iter()
            .find(|e| e.status == "Wipe completed successfully")
            .expect("wipe completion reported");
        assert_eq!(wipe_done.percentage, 80);
        assert_eq!(events.last().map(|e| e.percentage), Some(100));
    }

    #[tokio::test]
    async fn test_concurrency_cap_queues_devices() {
        let ws = Workspace::new();
        let mut config = ws.config();
        config.max_concurrent = 1;
        let probe = probe().with_device("/dev/fakeslow", MIB).with_device("/dev/fakequeued", MIB);
        let scheduler = OperationScheduler::new(&config, Arc::new(probe));

        let batch = scheduler
            .submit_batch(vec![
                OperationRequest::wipe("/dev/fakeslow", "zero"),
                OperationRequest::wipe("/dev/fakequeued", "zero"),
            ])
            .await;

        ws.wait_for_dd_runs("/dev/fakeslow", 1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(ws.dd_log("/dev/fakequeued").is_empty(), "second device must wait for a permit");
        assert_eq!(scheduler.active_devices().len(), 2, "queued devices are registered");

        // A queued device can be cancelled before it ever starts.
        scheduler.cancel("/dev/fakequeued").expect("queued device registered");
        scheduler.cancel("/dev/fakeslow").expect("running device registered");

        let results = batch.wait().await;
        assert!(results.iter().all(|r| r.is_cancelled()), "got {:?}", results);
        assert!(ws.dd_log("/dev/fakequeued").is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_device_in_batch_rejected() {
        let ws = Workspace::new();
        let scheduler = OperationScheduler::new(&ws.config(), Arc::new(probe().with_device("/dev/fakeslow", MIB)));

        let batch = scheduler
            .submit_batch(vec![
                OperationRequest::wipe("/dev/fakeslow", "zero"),
                OperationRequest::format("/dev/fakeslow", "ext4", None),
            ])
            .await;
        ws.wait_for_dd_runs("/dev/fakeslow", 1).await;
        assert_eq!(scheduler.shutdown(), 1);

        let results = batch.wait().await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_cancelled());
        assert!(results[1].reason().unwrap_or_default().contains("already in progress"));
    }

    #[tokio::test]
    async fn test_finished_operation_is_deregistered() {
        let ws = Workspace::new();
        let scheduler = OperationScheduler::new(&ws.config(), Arc::new(probe().with_device("/dev/fakezero", MIB)));

        let results = scheduler
            .submit_batch(vec![OperationRequest::wipe("/dev/fakezero", "random")])
            .await
            .wait()
            .await;

        assert!(results[0].is_success());
        assert!(scheduler.progress_of("/dev/fakezero").is_none());
        assert!(scheduler.cancel("/dev/fakezero").is_err(), "nothing left to cancel");
    }
}

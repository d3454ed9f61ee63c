//! Updater state machine tests
//!
//! The network is replaced by a scripted artifact source that writes real
//! gzip tar archives into the staging path, and the successor launcher only
//! records what it would have started.

use anyhow::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use phoenix_common::{
    ArtifactSource, FetchError, InstallStrategy, ProgramImage, StagingArtifact, UpdateRecord,
    UpdateSource, Validators,
};
use phoenixd::{SuccessorLauncher, UpdateOutcome, Updater, UpdaterState};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tempfile::TempDir;
use walkdir::WalkDir;

const ENTRY: &str = "phoenixd";
const POLL: Duration = Duration::from_secs(5);

// ============================================================================
// Fakes
// ============================================================================

enum Reply {
    Unreachable,
    NotModified,
    Serve(Vec<u8>),
}

/// Replays scripted replies; once exhausted every fetch is a hard failure
struct ScriptedSource {
    replies: RefCell<VecDeque<Reply>>,
}

impl ScriptedSource {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
        }
    }
}

impl ArtifactSource for ScriptedSource {
    fn fetch(&self, destination: &Path) -> Result<StagingArtifact, FetchError> {
        assert!(
            !destination.exists(),
            "staging path must be cleared before every attempt"
        );

        match self.replies.borrow_mut().pop_front() {
            Some(Reply::Unreachable) => Err(FetchError::Unreachable("connection refused".into())),
            Some(Reply::NotModified) => Err(FetchError::NotModified),
            Some(Reply::Serve(bytes)) => {
                fs::write(destination, bytes)?;
                let root = destination.parent().unwrap().to_path_buf();
                Ok(StagingArtifact::new(
                    destination.to_path_buf(),
                    root,
                    Validators {
                        etag: Some("\"build-2\"".to_string()),
                        last_modified: None,
                    },
                ))
            }
            None => Err(FetchError::Io(std::io::Error::new(std::io::ErrorKind::Other, "script exhausted"))),
        }
    }
}

/// Records launches along with the entry point's content at launch time
#[derive(Default)]
struct RecordingLauncher {
    launched: Vec<Vec<u8>>,
}

impl SuccessorLauncher for RecordingLauncher {
    fn launch(&mut self, image: &ProgramImage) -> Result<u32> {
        self.launched.push(fs::read(image.entry_point())?);
        Ok(4242)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn installed() -> (TempDir, ProgramImage) {
    let base = TempDir::new().unwrap();
    fs::write(base.path().join(ENTRY), b"build 1").unwrap();
    fs::write(base.path().join("config.txt"), b"keep me").unwrap();
    let image = ProgramImage::from_entry_point(base.path().join(ENTRY)).unwrap();
    (base, image)
}

fn source() -> UpdateSource {
    UpdateSource {
        url: "http://updates.local/phoenixd.tar.gz".to_string(),
        poll_interval: POLL,
    }
}

fn updater(
    image: ProgramImage,
    replies: Vec<Reply>,
    strategy: InstallStrategy,
) -> (Updater<ScriptedSource, RecordingLauncher>, Rc<RefCell<Vec<Duration>>>) {
    let pauses = Rc::new(RefCell::new(Vec::new()));
    let recorded = Rc::clone(&pauses);
    let updater = Updater::new(
        ScriptedSource::new(replies),
        RecordingLauncher::default(),
        image,
        &source(),
        strategy,
    )
    .with_pause(move |d| recorded.borrow_mut().push(d));
    (updater, pauses)
}

/// Every file under `dir` with its bytes
fn snapshot(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(dir)
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(dir).unwrap().to_path_buf();
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}

// ============================================================================
// Polling
// ============================================================================

#[test]
fn test_retries_unreachable_source_then_installs() {
    let (base, image) = installed();
    let replies = vec![
        Reply::Unreachable,
        Reply::Unreachable,
        Reply::Unreachable,
        Reply::Serve(archive(&[(ENTRY, b"build 2")])),
    ];
    let (mut updater, pauses) = updater(image, replies, InstallStrategy::ValidateThenSwap);

    let outcome = updater.run();

    assert_eq!(outcome, UpdateOutcome::Applied { successor_pid: 4242 });
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(updater.attempts(), 4);
    // Initial delay plus one per retry
    assert_eq!(*pauses.borrow(), vec![POLL; 4]);
    assert_eq!(updater.launcher().launched, vec![b"build 2".to_vec()]);
    assert_eq!(updater.state(), UpdaterState::Done);

    let extractions = updater
        .transitions()
        .iter()
        .filter(|s| **s == UpdaterState::Extracting)
        .count();
    assert_eq!(extractions, 1);
    assert_eq!(fs::read(base.path().join("config.txt")).unwrap(), b"keep me");
    assert!(!image_staging(base.path()).exists());
}

#[test]
fn test_transient_failures_leave_disk_unchanged() {
    let (base, image) = installed();
    let before = snapshot(base.path());
    let replies = vec![
        Reply::Unreachable,
        Reply::NotModified,
        Reply::Unreachable,
        Reply::NotModified,
    ];
    let (mut updater, pauses) = updater(image, replies, InstallStrategy::ValidateThenSwap);

    // The exhausted script ends the loop with a hard failure
    let outcome = updater.run();

    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(pauses.borrow().len(), 5);
    assert!(updater.launcher().launched.is_empty());
    assert_eq!(snapshot(base.path()), before);
}

#[test]
fn test_leftover_staging_archive_is_cleared() {
    let (base, image) = installed();
    fs::write(image.staging_archive(), b"half a download").unwrap();
    let replies = vec![Reply::Serve(archive(&[(ENTRY, b"build 2")]))];
    let (mut updater, _) = updater(image, replies, InstallStrategy::ValidateThenSwap);

    assert_eq!(updater.run().exit_code(), 0);
    assert_eq!(fs::read(base.path().join(ENTRY)).unwrap(), b"build 2");
}

#[test]
fn test_stale_scratch_directory_is_cleared() {
    let (base, image) = installed();
    let stale = base.path().join(".phoenix-extract-Xy12ab");
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join(ENTRY), b"half swapped build").unwrap();
    let replies = vec![
        Reply::Unreachable,
        Reply::Serve(archive(&[(ENTRY, b"build 2")])),
    ];
    let (mut updater, _) = updater(image, replies, InstallStrategy::ValidateThenSwap);

    assert_eq!(updater.run().exit_code(), 0);
    assert!(!stale.exists());
    assert_eq!(fs::read(base.path().join(ENTRY)).unwrap(), b"build 2");

    let leftovers: Vec<_> = fs::read_dir(base.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(".phoenix-extract-"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[test]
fn test_state_machine_order() {
    let (_base, image) = installed();
    let replies = vec![
        Reply::Unreachable,
        Reply::Serve(archive(&[(ENTRY, b"build 2")])),
    ];
    let (mut updater, _) = updater(image, replies, InstallStrategy::ValidateThenSwap);

    updater.run();

    use UpdaterState::*;
    assert_eq!(
        updater.transitions(),
        &[
            Idle,
            Polling,
            Downloading,
            Idle,
            Polling,
            Downloading,
            Extracting,
            Replacing,
            Launching,
            Done
        ]
    );
}

// ============================================================================
// Installation outcomes
// ============================================================================

#[test]
fn test_corrupt_archive_with_delete_then_extract_loses_image() {
    let (base, image) = installed();
    let replies = vec![Reply::Serve(b"definitely not gzip".to_vec())];
    let (mut updater, _) = updater(image, replies, InstallStrategy::DeleteThenExtract);

    let outcome = updater.run();

    assert!(
        matches!(outcome, UpdateOutcome::ArchiveRejected { image_intact: false, .. }),
        "{outcome:?}"
    );
    assert_eq!(outcome.exit_code(), 3);
    assert!(!base.path().join(ENTRY).exists());
    assert!(updater.launcher().launched.is_empty());
    assert!(!updater.transitions().contains(&UpdaterState::Launching));
    assert!(!image_staging(base.path()).exists());
}

#[test]
fn test_corrupt_archive_with_validate_then_swap_keeps_image() {
    let (base, image) = installed();
    let before = snapshot(base.path());
    let replies = vec![Reply::Serve(b"definitely not gzip".to_vec())];
    let (mut updater, _) = updater(image, replies, InstallStrategy::ValidateThenSwap);

    let outcome = updater.run();

    assert!(
        matches!(outcome, UpdateOutcome::ArchiveRejected { image_intact: true, .. }),
        "{outcome:?}"
    );
    assert_eq!(outcome.exit_code(), 2);
    assert!(updater.launcher().launched.is_empty());
    assert_eq!(snapshot(base.path()), before);
}

#[test]
fn test_archive_missing_entry_point_is_rejected() {
    let (base, image) = installed();
    let replies = vec![Reply::Serve(archive(&[("README", b"no binary here")]))];
    let (mut updater, _) = updater(image, replies, InstallStrategy::ValidateThenSwap);

    assert_eq!(updater.run().exit_code(), 2);
    assert_eq!(fs::read(base.path().join(ENTRY)).unwrap(), b"build 1");
    assert!(!base.path().join("README").exists());
}

#[test]
fn test_delete_then_extract_installs_good_archive() {
    let (base, image) = installed();
    let replies = vec![Reply::Serve(archive(&[(ENTRY, b"build 2")]))];
    let (mut updater, _) = updater(image, replies, InstallStrategy::DeleteThenExtract);

    assert_eq!(updater.run().exit_code(), 0);
    assert_eq!(updater.launcher().launched, vec![b"build 2".to_vec()]);
    assert_eq!(fs::read(base.path().join("config.txt")).unwrap(), b"keep me");
}

#[test]
fn test_update_record_saved_after_install() {
    let (base, image) = installed();
    let record_path = image.update_record_path();
    let replies = vec![Reply::Serve(archive(&[(ENTRY, b"build 2")]))];
    let (mut updater, _) = updater(image, replies, InstallStrategy::ValidateThenSwap);

    updater.run();

    let record = UpdateRecord::load(&record_path).expect("record written");
    assert_eq!(record.source_url, source().url);
    assert_eq!(record.validators.etag.as_deref(), Some("\"build-2\""));
    assert!(record_path.starts_with(base.path()));
}

#[test]
fn test_successor_launch_failure_is_generic_failure() {
    struct BrokenLauncher;
    impl SuccessorLauncher for BrokenLauncher {
        fn launch(&mut self, _image: &ProgramImage) -> Result<u32> {
            anyhow::bail!("permission denied")
        }
    }

    let (_base, image) = installed();
    let record_path = image.update_record_path();
    let mut updater = Updater::new(
        ScriptedSource::new(vec![Reply::Serve(archive(&[(ENTRY, b"build 2")]))]),
        BrokenLauncher,
        image,
        &source(),
        InstallStrategy::ValidateThenSwap,
    )
    .with_pause(|_| {});

    let outcome = updater.run();
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(updater.state(), UpdaterState::Launching);
    // The next updater must not see the archive as already current
    assert!(!record_path.exists());
}

fn image_staging(base: &Path) -> PathBuf {
    base.join(phoenix_common::image::STAGING_ARCHIVE_NAME)
}

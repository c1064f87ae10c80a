// Rotating file sink: file lifecycle, rotation policies, and the
// disk-space governor.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Datelike, Local};
use sysinfo::Disks;
use tokio::task::JoinHandle;

use super::{interruptible_sleep, Sink, SinkCore};
use crate::record::Record;

/// Formatted lines accumulate here before hitting the file.
const WRITE_BUFFER_SIZE: usize = 4096;

const DISK_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rotation {
    /// Append to the base file forever.
    None,
    /// Cascade-rename once the active file reaches `max_bytes`.
    BySize { max_bytes: u64, keep: u32 },
    /// Cascade-rename every `interval_secs`, driven by a monitor task.
    ByInterval { interval_secs: u64, keep: u32 },
    /// Re-open a date-suffixed file at a wall-clock time each day.
    AtTime { hour: u32, minute: u32, second: u32 },
}

struct FileState {
    file: Option<File>,
    /// Bytes written to the active file since it was opened, seeded from a
    /// stat at open time. A single oversized line can push the file past
    /// the rotation limit before the next check.
    active_size: u64,
    rotation: Rotation,
    last_rotated: DateTime<Local>,
}

/// A file sink with optional rotation. Created through the `register_*`
/// functions; the returned handle owns the sink and dropping it deregisters
/// the sink from the pipeline.
///
/// Lock order inside the sink is file state, then format, then filters.
pub struct RotatingFileSink {
    core: SinkCore,
    base_path: PathBuf,
    state: Mutex<FileState>,
    disk_full: AtomicBool,
    /// Used fraction of the log filesystem above which records are
    /// discarded. 1.0 logs until the disk is full.
    disk_threshold: Mutex<f64>,
    rotation_monitor: Mutex<Option<JoinHandle<()>>>,
    disk_monitor: Mutex<Option<JoinHandle<()>>>,
}

impl RotatingFileSink {
    /// Append-only sink on `path`. Must be called within a tokio runtime;
    /// the disk-space governor starts immediately.
    pub(crate) fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        let mut base_path = path.into();
        if base_path.as_os_str().is_empty() {
            base_path = PathBuf::from(format!("Unknown.{}.log", Local::now().timestamp()));
        }

        let sink = Arc::new(Self {
            core: SinkCore::new(),
            base_path,
            state: Mutex::new(FileState {
                file: None,
                active_size: 0,
                rotation: Rotation::None,
                last_rotated: Local::now(),
            }),
            disk_full: AtomicBool::new(false),
            disk_threshold: Mutex::new(1.0),
            rotation_monitor: Mutex::new(None),
            disk_monitor: Mutex::new(None),
        });

        let monitor = tokio::spawn(disk_monitor(Arc::downgrade(&sink)));
        *sink.disk_monitor.lock().unwrap() = Some(monitor);
        sink
    }

    /// Switch to plain append mode and open the base file.
    pub fn append_only(&self) {
        self.stop_rotation_monitor();
        let mut state = self.state.lock().unwrap();
        state.rotation = Rotation::None;
        let name = self.construct_filename(&state);
        open_log(&mut state, &name);
    }

    /// Rotate once the active file reaches `max_bytes`, retaining `keep`
    /// files in total. The write path itself checks the size; no monitor
    /// task is needed.
    pub fn rotate_at_size(&self, max_bytes: u64, keep: u32) {
        self.stop_rotation_monitor();
        let mut state = self.state.lock().unwrap();
        state.rotation = Rotation::BySize { max_bytes, keep };
        let name = self.construct_filename(&state);
        open_log(&mut state, &name);
    }

    /// Rotate every `interval_secs` seconds, retaining `keep` files.
    pub fn rotate_after(self: &Arc<Self>, interval_secs: u64, keep: u32) {
        self.stop_rotation_monitor();
        {
            let mut state = self.state.lock().unwrap();
            state.rotation = Rotation::ByInterval {
                interval_secs,
                keep,
            };
            let name = self.construct_filename(&state);
            open_log(&mut state, &name);
        }
        let handle = tokio::spawn(interval_rotation_monitor(
            Arc::downgrade(self),
            interval_secs,
        ));
        *self.rotation_monitor.lock().unwrap() = Some(handle);
    }

    /// Re-open a date-suffixed file at `hour:minute:second` local time each
    /// day. The suffix names the day the current interval started.
    pub fn rotate_at_time(self: &Arc<Self>, hour: u32, minute: u32, second: u32) {
        let (hour, minute, second) = (hour.min(23), minute.min(59), second.min(59));
        self.stop_rotation_monitor();
        {
            let mut state = self.state.lock().unwrap();
            state.rotation = Rotation::AtTime {
                hour,
                minute,
                second,
            };
            let name = self.construct_filename(&state);
            open_log(&mut state, &name);
        }
        let handle = tokio::spawn(daily_rotation_monitor(
            Arc::downgrade(self),
            hour,
            minute,
            second,
        ));
        *self.rotation_monitor.lock().unwrap() = Some(handle);
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn stop_rotation_monitor(&self) {
        if let Some(handle) = self.rotation_monitor.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// The file the sink should be writing right now. Date-suffixed names
    /// depend on wall-clock time; everything else uses the base name.
    fn construct_filename(&self, state: &FileState) -> PathBuf {
        match state.rotation {
            Rotation::AtTime {
                hour,
                minute,
                second,
            } => {
                let now = Local::now().naive_local();
                let mut switch = now
                    .date()
                    .and_hms_opt(hour, minute, second)
                    .unwrap_or(now);
                // Before today's switch time the file still belongs to the
                // interval that started yesterday.
                if now < switch {
                    switch = switch - chrono::Duration::days(1);
                }
                let date = switch.date();
                filename_with_suffix(
                    &self.base_path,
                    &format!("{}.{}.{}", date.year(), date.month(), date.day()),
                )
            }
            _ => self.base_path.clone(),
        }
    }

    /// Shift `name.i` to `name.{i+1}` for every retained slot, deleting the
    /// oldest, then move the base file to `name.1`. With `keep <= 1` the
    /// base file is simply discarded.
    fn rename_existing_logs(&self, keep: u32) {
        let base = &self.base_path;

        if keep <= 1 {
            if base.exists() {
                if let Err(err) = fs::remove_file(base) {
                    eprintln!("failed to remove {}: {}", base.display(), err);
                }
            }
            return;
        }

        let oldest = numbered(base, keep - 1);
        if oldest.exists() {
            if let Err(err) = fs::remove_file(&oldest) {
                eprintln!("failed to remove {}: {}", oldest.display(), err);
            }
        }

        for i in (1..keep).rev() {
            let from = numbered(base, i);
            if !from.exists() {
                continue;
            }
            let to = numbered(base, i + 1);
            if let Err(err) = fs::rename(&from, &to) {
                eprintln!(
                    "failed to rename {} to {}: {}",
                    from.display(),
                    to.display(),
                    err
                );
            }
        }

        if base.exists() {
            let to = numbered(base, 1);
            if let Err(err) = fs::rename(base, &to) {
                eprintln!(
                    "failed to rename {} to {}: {}",
                    base.display(),
                    to.display(),
                    err
                );
            }
        }
    }

    /// Rotate if the policy says the active file is due. The caller holds
    /// the state lock.
    fn check_size_and_shift(&self, state: &mut FileState) {
        if self.core.quitting() {
            return;
        }

        let due = match state.rotation {
            Rotation::BySize { max_bytes, .. } => state.active_size >= max_bytes,
            Rotation::ByInterval { interval_secs, .. } => {
                Local::now() - state.last_rotated >= chrono::Duration::seconds(interval_secs as i64)
            }
            _ => false,
        };
        if !due {
            return;
        }

        eprintln!("rotating {} to a new log", self.base_path.display());
        state.file = None;
        if let Rotation::BySize { keep, .. } | Rotation::ByInterval { keep, .. } = state.rotation {
            self.rename_existing_logs(keep);
        }
        let name = self.construct_filename(state);
        open_log(state, &name);
    }

    fn write_buffer(&self, state: &mut FileState, buffer: &mut String) {
        if let Some(file) = state.file.as_mut() {
            if let Err(err) = file
                .write_all(buffer.as_bytes())
                .and_then(|_| file.flush())
            {
                eprintln!("write to {} failed: {}", self.base_path.display(), err);
            }
            state.active_size += buffer.len() as u64;
        }
        buffer.clear();
    }

    /// Sample filesystem usage for the directory holding the active log and
    /// update the disk-full flag.
    fn refresh_disk_usage(&self) {
        let name = {
            let state = self.state.lock().unwrap();
            self.construct_filename(&state)
        };
        let parent = name
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let Ok(parent) = parent.canonicalize() else {
            return;
        };

        let threshold = *self.disk_threshold.lock().unwrap();
        let disks = Disks::new_with_refreshed_list();
        let Some(disk) = disks
            .list()
            .iter()
            .filter(|d| parent.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
        else {
            return;
        };

        let total = disk.total_space();
        if total == 0 {
            return;
        }
        let used = (total - disk.available_space()) as f64 / total as f64;
        self.set_disk_full(used >= threshold);
    }

    fn set_disk_full(&self, full: bool) {
        let was = self.disk_full.swap(full, Ordering::Relaxed);
        if was != full {
            crate::note_disk_full_transition(full);
        }
    }

    fn disk_full(&self) -> bool {
        self.disk_full.load(Ordering::Relaxed)
    }
}

impl Sink for RotatingFileSink {
    fn consume(&self, batch: &[Record]) {
        if self.core.quitting() {
            return;
        }

        let mut state = self.state.lock().unwrap();
        let format = self.core.lock_format();
        let mut filters = self.core.lock_filters();

        if state.file.is_none() {
            let name = self.construct_filename(&state);
            open_log(&mut state, &name);
        }
        // An unopenable file drops this batch; the next one retries.
        if state.file.is_none() {
            return;
        }

        let mut buffer = String::with_capacity(WRITE_BUFFER_SIZE);
        for record in batch {
            if self.core.quitting() || self.disk_full() {
                break;
            }
            if !filters.meets_criteria(record) {
                continue;
            }
            format.append_line(record, &mut buffer);
            buffer.push('\n');
            if buffer.len() >= WRITE_BUFFER_SIZE {
                self.write_buffer(&mut state, &mut buffer);
                self.check_size_and_shift(&mut state);
            }
        }

        if !buffer.is_empty() && !self.core.quitting() && !self.disk_full() {
            self.write_buffer(&mut state, &mut buffer);
            self.check_size_and_shift(&mut state);
        }
    }

    fn core(&self) -> &SinkCore {
        &self.core
    }

    fn set_disk_threshold(&self, fraction: f64) {
        *self.disk_threshold.lock().unwrap() = fraction.clamp(0.0, 1.0);
    }
}

impl Drop for RotatingFileSink {
    fn drop(&mut self) {
        self.core.request_quit();
        if self.disk_full.load(Ordering::Relaxed) {
            crate::note_disk_full_transition(false);
        }
        for slot in [&self.rotation_monitor, &self.disk_monitor] {
            if let Some(handle) = slot.lock().unwrap().take() {
                handle.abort();
            }
        }
    }
}

/// Close whatever is open, open `path` for appending, and seed the size
/// counter from the file on disk.
fn open_log(state: &mut FileState, path: &Path) {
    state.file = None;
    state.active_size = 0;

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            state.active_size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            state.file = Some(file);
        }
        Err(err) => eprintln!("unable to open {} for logging: {}", path.display(), err),
    }

    state.last_rotated = Local::now();
}

fn filename_with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn numbered(base: &Path, i: u32) -> PathBuf {
    filename_with_suffix(base, &i.to_string())
}

fn sink_gone(sink: &Weak<RotatingFileSink>) -> bool {
    sink.upgrade().map_or(true, |s| s.core.quitting())
}

/// Wakes every five seconds, samples filesystem usage, and flips the sink's
/// disk-full flag. Exits when the sink goes away.
async fn disk_monitor(sink: Weak<RotatingFileSink>) {
    loop {
        let Some(strong) = sink.upgrade() else { return };
        if strong.core.quitting() {
            return;
        }
        strong.refresh_disk_usage();
        drop(strong);

        let watch = sink.clone();
        interruptible_sleep(DISK_CHECK_INTERVAL, move || sink_gone(&watch)).await;
    }
}

/// Sleeps out the rotation interval and rotates, unless something else
/// re-opened the file in the meantime.
async fn interval_rotation_monitor(sink: Weak<RotatingFileSink>, interval_secs: u64) {
    loop {
        let Some(strong) = sink.upgrade() else { return };
        if strong.core.quitting() {
            return;
        }
        let last_rotated = strong.state.lock().unwrap().last_rotated;
        drop(strong);

        let rotate_at = last_rotated + chrono::Duration::seconds(interval_secs as i64);
        let remaining = (rotate_at - Local::now()).to_std().unwrap_or_default();
        let watch = sink.clone();
        interruptible_sleep(remaining, move || sink_gone(&watch)).await;

        let Some(strong) = sink.upgrade() else { return };
        if strong.core.quitting() {
            return;
        }
        let mut state = strong.state.lock().unwrap();
        // A different timestamp means the file was re-opened while we
        // slept; skip this round.
        if state.last_rotated != last_rotated {
            continue;
        }
        state.file = None;
        if let Rotation::ByInterval { keep, .. } = state.rotation {
            strong.rename_existing_logs(keep);
        }
        let name = strong.construct_filename(&state);
        open_log(&mut state, &name);
    }
}

/// Sleeps until the next scheduled wall-clock time and re-opens the
/// date-derived filename.
async fn daily_rotation_monitor(sink: Weak<RotatingFileSink>, hour: u32, minute: u32, second: u32) {
    loop {
        let Some(strong) = sink.upgrade() else { return };
        if strong.core.quitting() {
            return;
        }
        drop(strong);

        let now = Local::now().naive_local();
        let mut switch = now.date().and_hms_opt(hour, minute, second).unwrap_or(now);
        if switch <= now {
            switch = switch + chrono::Duration::days(1);
        }
        let remaining = (switch - now).to_std().unwrap_or_default();
        let watch = sink.clone();
        interruptible_sleep(remaining, move || sink_gone(&watch)).await;

        let Some(strong) = sink.upgrade() else { return };
        if strong.core.quitting() {
            return;
        }
        let mut state = strong.state.lock().unwrap();
        let name = strong.construct_filename(&state);
        open_log(&mut state, &name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(source: &'static str, tags: Vec<&'static str>, payload: &str) -> Record {
        Record::new(source, tags, payload.to_string())
    }

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_append_only_writes_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.log");

        let sink = RotatingFileSink::new(&path);
        sink.set_configuration("%m", crate::format::DEFAULT_DATE_FORMAT);
        sink.consume(&[
            record("file_test_a", vec![], "one"),
            record("file_test_a", vec![], "two"),
        ]);

        assert_eq!(read_lines(&path), vec!["one", "two"]);

        // A second batch appends.
        sink.consume(&[record("file_test_a", vec![], "three")]);
        assert_eq!(read_lines(&path), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_lines_match_format_engine_output() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("formatted.log");

        let sink = RotatingFileSink::new(&path);
        sink.set_configuration("%S | %m", crate::format::DEFAULT_DATE_FORMAT);
        let r = record("dir/file_test_fmt.rs::3", vec![], "body");
        let expected = sink.core().lock_format().format_record(&r);
        sink.consume(&[r]);

        assert_eq!(read_lines(&path), vec![expected]);
    }

    #[tokio::test]
    async fn test_filters_drop_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("filtered.log");

        let sink = RotatingFileSink::new(&path);
        sink.set_configuration("%m", crate::format::DEFAULT_DATE_FORMAT);
        sink.add_filter(Box::new(|r| r.tags.contains(&"keep")));

        sink.consume(&[
            record("file_test_f1", vec!["keep"], "kept"),
            record("file_test_f2", vec!["drop"], "dropped"),
            // Same source as the first record: admitted from the cache even
            // though its tags no longer match.
            record("file_test_f1", vec!["drop"], "cached"),
        ]);

        assert_eq!(read_lines(&path), vec!["kept", "cached"]);
    }

    #[tokio::test]
    async fn test_cache_disabled_reevaluates_per_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nocache.log");

        let sink = RotatingFileSink::new(&path);
        sink.set_configuration("%m", crate::format::DEFAULT_DATE_FORMAT);
        sink.add_filter(Box::new(|r| r.tags.contains(&"keep")));
        sink.disable_cache();

        sink.consume(&[
            record("file_test_nc", vec!["keep"], "kept"),
            record("file_test_nc", vec!["drop"], "rejected"),
        ]);

        assert_eq!(read_lines(&path), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_size_rotation_cascade() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rotated.log");

        let sink = RotatingFileSink::new(&path);
        sink.set_configuration("%m", crate::format::DEFAULT_DATE_FORMAT);
        sink.rotate_at_size(1024, 3);

        // One-byte payloads, two bytes per line with the newline.
        let batch: Vec<Record> = (0..5000)
            .map(|_| record("file_test_rot", vec![], "x"))
            .collect();
        sink.consume(&batch);

        assert!(path.exists());
        assert!(numbered(&path, 1).exists());
        assert!(numbered(&path, 2).exists());
        assert!(!numbered(&path, 3).exists());

        for i in 1..=2 {
            let rotated = numbered(&path, i);
            assert!(fs::metadata(&rotated).unwrap().len() >= 1024);
        }
    }

    #[tokio::test]
    async fn test_size_rotation_keep_one_discards() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("single.log");

        let sink = RotatingFileSink::new(&path);
        sink.set_configuration("%m", crate::format::DEFAULT_DATE_FORMAT);
        sink.rotate_at_size(1024, 1);

        let batch: Vec<Record> = (0..3000)
            .map(|_| record("file_test_k1", vec![], "x"))
            .collect();
        sink.consume(&batch);

        assert!(path.exists());
        assert!(!numbered(&path, 1).exists());
    }

    #[tokio::test]
    async fn test_rename_cascade_shifts_numbers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cascade.log");

        fs::write(&path, "base").unwrap();
        fs::write(numbered(&path, 1), "one").unwrap();
        fs::write(numbered(&path, 2), "two").unwrap();

        let sink = RotatingFileSink::new(&path);
        sink.rename_existing_logs(3);

        // Oldest slot deleted, everything else shifted up one.
        assert!(!path.exists());
        assert_eq!(fs::read_to_string(numbered(&path, 1)).unwrap(), "base");
        assert_eq!(fs::read_to_string(numbered(&path, 2)).unwrap(), "one");
        assert!(!numbered(&path, 3).exists());
    }

    #[tokio::test]
    async fn test_daily_filename_uses_interval_start() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daily.log");

        let sink = RotatingFileSink::new(&path);
        // Rotation at midnight: the current interval always started today.
        sink.rotate_at_time(0, 0, 0);

        let today = Local::now().naive_local().date();
        let expected = filename_with_suffix(
            &path,
            &format!("{}.{}.{}", today.year(), today.month(), today.day()),
        );
        assert!(expected.exists());

        {
            let state = sink.state.lock().unwrap();
            assert_eq!(sink.construct_filename(&state), expected);
        }

        // A switch time later than now labels the file with yesterday.
        let sink_late = RotatingFileSink::new(dir.path().join("late.log"));
        {
            let mut state = sink_late.state.lock().unwrap();
            state.rotation = Rotation::AtTime {
                hour: 23,
                minute: 59,
                second: 59,
            };
            let name = sink_late.construct_filename(&state);
            let yesterday = (Local::now().naive_local() - chrono::Duration::days(1)).date();
            let expected_late = filename_with_suffix(
                &sink_late.base_path,
                &format!(
                    "{}.{}.{}",
                    yesterday.year(),
                    yesterday.month(),
                    yesterday.day()
                ),
            );
            // Unless the test runs in the final second of the day, the
            // interval started yesterday.
            if Local::now().naive_local().time() < chrono::NaiveTime::from_hms_opt(23, 59, 59).unwrap() {
                assert_eq!(name, expected_late);
            }
        }
    }

    #[tokio::test]
    async fn test_disk_full_discards_silently() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("full.log");

        let sink = RotatingFileSink::new(&path);
        sink.set_configuration("%m", crate::format::DEFAULT_DATE_FORMAT);
        sink.consume(&[record("file_test_df", vec![], "before")]);

        sink.set_disk_full(true);
        sink.consume(&[record("file_test_df", vec![], "during")]);
        sink.set_disk_full(false);
        sink.consume(&[record("file_test_df", vec![], "after")]);

        assert_eq!(read_lines(&path), vec!["before", "after"]);
    }

    #[tokio::test]
    async fn test_disk_threshold_clamped() {
        let dir = tempdir().unwrap();
        let sink = RotatingFileSink::new(dir.path().join("clamp.log"));

        sink.set_disk_threshold(2.5);
        assert_eq!(*sink.disk_threshold.lock().unwrap(), 1.0);
        sink.set_disk_threshold(-0.5);
        assert_eq!(*sink.disk_threshold.lock().unwrap(), 0.0);
        sink.set_disk_threshold(0.75);
        assert_eq!(*sink.disk_threshold.lock().unwrap(), 0.75);
    }

    #[tokio::test]
    async fn test_interval_monitor_rotates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("interval.log");

        let sink = RotatingFileSink::new(&path);
        sink.set_configuration("%m", crate::format::DEFAULT_DATE_FORMAT);
        sink.rotate_after(1, 3);
        sink.consume(&[record("file_test_iv", vec![], "first interval")]);

        tokio::time::sleep(Duration::from_millis(1500)).await;

        // The monitor rotated: the old content moved into the cascade. On a
        // slow runner a second rotation may already have pushed it to .2.
        assert!(numbered(&path, 1).exists());
        let mut shifted = read_lines(&numbered(&path, 1));
        shifted.extend(read_lines(&numbered(&path, 2)));
        assert!(shifted.contains(&"first interval".to_string()));
    }

    #[tokio::test]
    async fn test_quit_flag_stops_consume() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quit.log");

        let sink = RotatingFileSink::new(&path);
        sink.set_configuration("%m", crate::format::DEFAULT_DATE_FORMAT);
        sink.core.request_quit();
        sink.consume(&[record("file_test_q", vec![], "never written")]);

        assert!(read_lines(&path).is_empty());
    }
}

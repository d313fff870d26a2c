//! External optimizer passes.
//!
//! Each pass runs one tool (`pngquant`, `optipng`, `pngcrush`, `jpegoptim`,
//! `jpegtran` or `cwebp`) against a private temp file next to the working
//! file. The working file is replaced only when the tool exits zero and
//! leaves a non-empty result; otherwise the temp file is dropped and the
//! working file is untouched. A pass that outlives its deadline is killed
//! and counts as failed.
//!
//! Tools are started with an argument list, never through a shell.
//!
//! ## Pass order
//!
//! | Format | Passes |
//! |---|---|
//! | PNG | `pngquant` (+ `optipng -o1`), else `pngcrush`, else `optipng` |
//! | JPEG | `jpegoptim`, else `jpegtran` |
//! | any non-GIF | `cwebp`, tried first by the WebP negotiator |

use crate::config::OptimizersConfig;
use crate::imaging::StripMode;
use crate::orientation;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often a running tool is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a tool invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Success,
    /// Non-zero exit, with the code when the process exited normally.
    Failed(Option<i32>),
    TimedOut,
}

/// Runs external tools. Tests substitute a scripted runner.
pub trait ToolRunner: Sync {
    fn run(&self, program: &Path, args: &[OsString], timeout: Duration) -> io::Result<ToolStatus>;
}

/// Child-process runner with a per-invocation deadline.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    fn run(&self, program: &Path, args: &[OsString], timeout: Duration) -> io::Result<ToolStatus> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(if status.success() {
                    ToolStatus::Success
                } else {
                    ToolStatus::Failed(status.code())
                });
            }
            if Instant::now() >= deadline {
                // already exited between the poll and now: nothing to kill
                let _ = child.kill();
                child.wait()?;
                return Ok(ToolStatus::TimedOut);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Result of one optimizer pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassOutcome {
    pub tool: &'static str,
    pub applied: bool,
    pub original_size: u64,
    pub new_size: u64,
}

impl PassOutcome {
    fn skipped(tool: &'static str, size: u64) -> Self {
        Self {
            tool,
            applied: false,
            original_size: size,
            new_size: size,
        }
    }
}

/// Optimizer pipeline over one working file.
pub struct Optimizer<'a> {
    config: &'a OptimizersConfig,
    runner: &'a dyn ToolRunner,
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn arg(value: impl Into<OsString>) -> OsString {
    value.into()
}

/// Copy `file` to `dest` and bake its EXIF orientation into the copy.
fn copy_rotated(file: &Path, dest: &Path, quality: u32) -> io::Result<()> {
    fs::copy(file, dest)?;
    orientation::rotate_using_exif(dest, quality).map_err(io::Error::other)?;
    Ok(())
}

/// How the pass's temp file is prepared before the tool runs.
enum Staging {
    /// Tool writes its own output into an empty temp file.
    Output,
    /// Tool edits a copy of the working file in place.
    Copy,
    /// As `Copy`, with EXIF orientation baked in first.
    RotatedCopy { quality: u32 },
}

impl<'a> Optimizer<'a> {
    pub fn new(config: &'a OptimizersConfig, runner: &'a dyn ToolRunner) -> Self {
        Self { config, runner }
    }

    /// Run `program` against a temp file and replace `file` on success.
    fn run_pass<A>(
        &self,
        tool: &'static str,
        program: &Path,
        file: &Path,
        staging: Staging,
        args: A,
    ) -> PassOutcome
    where
        A: FnOnce(&Path) -> Vec<OsString>,
    {
        let original_size = file_size(file);
        let dir = file.parent().unwrap_or_else(|| Path::new("."));
        let staged = tempfile::Builder::new()
            .prefix(&format!("{tool}-"))
            .tempfile_in(dir)
            .and_then(|tmp| {
                match staging {
                    Staging::Output => {}
                    Staging::Copy => {
                        fs::copy(file, tmp.path())?;
                    }
                    Staging::RotatedCopy { quality } => {
                        copy_rotated(file, tmp.path(), quality)?;
                    }
                }
                Ok(tmp)
            });
        let tmp = match staged {
            Ok(tmp) => tmp,
            Err(e) => {
                warn!(tool, error = %e, "could not stage optimizer pass");
                return PassOutcome::skipped(tool, original_size);
            }
        };

        let args = args(tmp.path());
        let status = match self
            .runner
            .run(program, &args, self.config.pass_timeout())
        {
            Ok(status) => status,
            Err(e) => {
                warn!(tool, program = %program.display(), error = %e, "optimizer failed to start");
                return PassOutcome::skipped(tool, original_size);
            }
        };

        let new_size = file_size(tmp.path());
        if status != ToolStatus::Success || new_size == 0 {
            warn!(tool, ?status, new_size, "optimizer pass discarded");
            return PassOutcome::skipped(tool, original_size);
        }

        if let Err(e) = tmp.persist(file) {
            warn!(tool, error = %e.error, "could not replace working file");
            return PassOutcome::skipped(tool, original_size);
        }
        debug!(tool, original_size, new_size, "optimizer pass applied");
        PassOutcome {
            tool,
            applied: true,
            original_size,
            new_size,
        }
    }

    /// PNG passes in priority order. Returns every pass that ran.
    pub fn optimize_png(&self, file: &Path, quality: u32) -> Vec<PassOutcome> {
        let mut outcomes = Vec::new();
        if let Some(pngquant) = self.config.pngquant() {
            outcomes.push(self.run_pass("pngquant", &pngquant, file, Staging::Output, |out| {
                vec![
                    arg("--speed"),
                    arg("5"),
                    arg(format!("--quality={quality}-100")),
                    arg("-f"),
                    arg("-o"),
                    arg(out),
                    arg(file),
                ]
            }));
            if let Some(optipng) = self.config.optipng() {
                outcomes.push(self.optipng(&optipng, file, Some("-o1")));
            }
        } else if let Some(pngcrush) = self.config.pngcrush() {
            outcomes.push(self.run_pass("pngcrush", &pngcrush, file, Staging::Output, |out| {
                vec![arg(file), arg(out)]
            }));
        } else if let Some(optipng) = self.config.optipng() {
            outcomes.push(self.optipng(&optipng, file, None));
        }
        outcomes
    }

    fn optipng(&self, program: &Path, file: &Path, level: Option<&str>) -> PassOutcome {
        self.run_pass("optipng", program, file, Staging::Copy, |copy| {
            let mut args: Vec<OsString> = level.map(arg).into_iter().collect();
            args.push(arg(copy));
            args
        })
    }

    /// JPEG passes in priority order. `quality` is used to re-encode when
    /// EXIF orientation has to be baked in before metadata is stripped.
    pub fn optimize_jpeg(
        &self,
        file: &Path,
        strip: Option<StripMode>,
        quality: u32,
    ) -> Vec<PassOutcome> {
        if let Some(jpegoptim) = self.config.jpegoptim() {
            let staging = match strip {
                Some(mode) if mode.drops_orientation() => Staging::RotatedCopy { quality },
                _ => Staging::Copy,
            };
            return vec![self.run_pass("jpegoptim", &jpegoptim, file, staging, |copy| {
                let mut args = vec![arg("-T0.0"), arg("--all-progressive")];
                args.extend(jpegoptim_strip_flags(strip).iter().copied().map(arg));
                args.push(arg("-p"));
                args.push(arg(copy));
                args
            })];
        }
        if let Some(jpegtran) = self.config.jpegtran() {
            return vec![self.run_pass("jpegtran", &jpegtran, file, Staging::Output, |out| {
                vec![
                    arg("-copy"),
                    arg("all"),
                    arg("-optimize"),
                    arg("-progressive"),
                    arg("-outfile"),
                    arg(out),
                    arg(file),
                ]
            })];
        }
        Vec::new()
    }

    /// Convert the working file to WebP with `cwebp`. `flags` precede `-o`.
    ///
    /// `rotate_quality` feeds `cwebp` an upright copy of the working file,
    /// for JPEG sources whose metadata the conversion drops. The working
    /// file itself only changes when the conversion succeeds.
    pub fn cwebp(&self, file: &Path, flags: Vec<OsString>, rotate_quality: Option<u32>) -> Option<PassOutcome> {
        let cwebp = self.config.cwebp()?;
        let rotated = rotate_quality.and_then(|quality| {
            let dir = file.parent().unwrap_or_else(|| Path::new("."));
            let staged = tempfile::Builder::new()
                .prefix("cwebp-in-")
                .tempfile_in(dir)
                .and_then(|tmp| copy_rotated(file, tmp.path(), quality).map(|()| tmp));
            match staged {
                Ok(tmp) => Some(tmp),
                Err(e) => {
                    warn!(error = %e, "EXIF rotation before WebP conversion failed");
                    None
                }
            }
        });
        let input = rotated.as_ref().map_or(file, |tmp| tmp.path());
        Some(self.run_pass("cwebp", &cwebp, file, Staging::Output, |out| {
            let mut args = flags;
            args.extend([arg("-o"), arg(out), arg(input)]);
            args
        }))
    }

    pub fn webp_available(&self) -> bool {
        self.config.cwebp().is_some()
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.config.temp_dir()
    }
}

/// `jpegoptim` flags for a strip mode.
pub fn jpegoptim_strip_flags(strip: Option<StripMode>) -> &'static [&'static str] {
    match strip {
        Some(StripMode::All) => &["-f", "--strip-all"],
        Some(StripMode::Info) => &["-f", "--strip-com", "--strip-exif", "--strip-iptc"],
        Some(StripMode::Color) => &["-f", "--strip-icc"],
        Some(StripMode::None) | None => &[],
    }
}

/// Bytes removed between the primary encode and the final file. Never negative.
pub fn bytes_saved(before: u64, after: u64) -> u64 {
    before.saturating_sub(after)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::orientation::tests::tagged_jpeg;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// What a scripted tool does when run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Script {
        /// Write `bytes` to the path following `-o`/`-outfile`, or the last
        /// argument when there is none, and succeed.
        Write(&'static [u8]),
        /// Exit non-zero without writing.
        Fail,
        /// Succeed without writing anything.
        Silent,
        TimeOut,
    }

    /// Runner that records invocations and plays back a script.
    pub(crate) struct ScriptedRunner {
        pub script: Script,
        pub calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
    }

    impl ScriptedRunner {
        pub(crate) fn new(script: Script) -> Self {
            Self {
                script,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn programs(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(p, _)| p.display().to_string())
                .collect()
        }

        pub(crate) fn args(&self, index: usize) -> Vec<String> {
            self.calls.lock().unwrap()[index].1.clone()
        }
    }

    fn output_path(args: &[String]) -> PathBuf {
        args.iter()
            .position(|a| a == "-o" || a == "-outfile")
            .and_then(|i| args.get(i + 1))
            .or_else(|| args.last())
            .map(PathBuf::from)
            .unwrap()
    }

    impl ToolRunner for ScriptedRunner {
        fn run(&self, program: &Path, args: &[OsString], _timeout: Duration) -> io::Result<ToolStatus> {
            let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
            self.calls
                .lock()
                .unwrap()
                .push((program.to_path_buf(), args.clone()));
            match self.script {
                Script::Write(bytes) => {
                    fs::write(output_path(&args), bytes)?;
                    Ok(ToolStatus::Success)
                }
                Script::Fail => Ok(ToolStatus::Failed(Some(1))),
                Script::Silent => Ok(ToolStatus::Success),
                Script::TimeOut => Ok(ToolStatus::TimedOut),
            }
        }
    }

    fn working_file(dir: &TempDir, contents: &[u8]) -> PathBuf {
        let path = dir.path().join("pre-work");
        fs::write(&path, contents).unwrap();
        path
    }

    fn config(tools: &[&str]) -> OptimizersConfig {
        let mut config = OptimizersConfig::default();
        for tool in tools {
            let path = Some(PathBuf::from(format!("/opt/{tool}")));
            match *tool {
                "pngquant" => config.pngquant = path,
                "optipng" => config.optipng = path,
                "pngcrush" => config.pngcrush = path,
                "jpegoptim" => config.jpegoptim = path,
                "jpegtran" => config.jpegtran = path,
                "cwebp" => config.cwebp = path,
                other => panic!("unknown tool {other}"),
            }
        }
        config
    }

    fn leftover_temp_files(dir: &TempDir) -> usize {
        fs::read_dir(dir.path()).unwrap().count() - 1
    }

    // =========================================================================
    // Pass mechanics
    // =========================================================================

    #[test]
    fn successful_pass_replaces_working_file() {
        let dir = TempDir::new().unwrap();
        let file = working_file(&dir, b"0123456789");
        let config = config(&["jpegtran"]);
        let runner = ScriptedRunner::new(Script::Write(b"small"));

        let outcomes = Optimizer::new(&config, &runner).optimize_jpeg(&file, None, 90);

        assert_eq!(
            outcomes,
            vec![PassOutcome {
                tool: "jpegtran",
                applied: true,
                original_size: 10,
                new_size: 5,
            }]
        );
        assert_eq!(fs::read(&file).unwrap(), b"small");
        assert_eq!(leftover_temp_files(&dir), 0);
    }

    #[test]
    fn failed_pass_leaves_working_file_untouched() {
        for script in [Script::Fail, Script::Silent, Script::TimeOut] {
            let dir = TempDir::new().unwrap();
            let file = working_file(&dir, b"original");
            let config = config(&["pngcrush"]);
            let runner = ScriptedRunner::new(script);

            let outcomes = Optimizer::new(&config, &runner).optimize_png(&file, 80);

            assert!(!outcomes[0].applied, "{script:?}");
            assert_eq!(fs::read(&file).unwrap(), b"original");
            assert_eq!(leftover_temp_files(&dir), 0, "{script:?}");
        }
    }

    #[test]
    fn disabled_optimizers_run_nothing() {
        let dir = TempDir::new().unwrap();
        let file = working_file(&dir, b"png");
        let mut config = config(&["pngquant", "optipng", "cwebp"]);
        config.disabled = true;
        let runner = ScriptedRunner::new(Script::Write(b"x"));
        let optimizer = Optimizer::new(&config, &runner);

        assert!(optimizer.optimize_png(&file, 80).is_empty());
        assert!(optimizer.cwebp(&file, Vec::new(), None).is_none());
        assert!(!optimizer.webp_available());
        assert!(runner.programs().is_empty());
    }

    // =========================================================================
    // Pass order and arguments
    // =========================================================================

    #[test]
    fn pngquant_then_optipng() {
        let dir = TempDir::new().unwrap();
        let file = working_file(&dir, b"png bytes");
        let config = config(&["pngquant", "optipng", "pngcrush"]);
        let runner = ScriptedRunner::new(Script::Write(b"q"));

        Optimizer::new(&config, &runner).optimize_png(&file, 65);

        assert_eq!(runner.programs(), ["/opt/pngquant", "/opt/optipng"]);
        let args = runner.args(0);
        assert_eq!(&args[..4], ["--speed", "5", "--quality=65-100", "-f"]);
        assert_eq!(args.last().unwrap(), &file.display().to_string());
        assert_eq!(runner.args(1)[0], "-o1");
    }

    #[test]
    fn pngcrush_before_plain_optipng() {
        let dir = TempDir::new().unwrap();
        let file = working_file(&dir, b"png bytes");
        let runner = ScriptedRunner::new(Script::Write(b"q"));

        let config_both = config(&["pngcrush", "optipng"]);
        Optimizer::new(&config_both, &runner).optimize_png(&file, 65);
        assert_eq!(runner.programs(), ["/opt/pngcrush"]);
        assert_eq!(runner.args(0)[0], file.display().to_string());

        let config_opti = config(&["optipng"]);
        Optimizer::new(&config_opti, &runner).optimize_png(&file, 65);
        assert_eq!(runner.args(1).len(), 1);
    }

    #[test]
    fn jpegoptim_strip_flags_follow_mode() {
        let dir = TempDir::new().unwrap();
        let file = working_file(&dir, b"jpeg bytes");
        let config = config(&["jpegoptim", "jpegtran"]);
        let runner = ScriptedRunner::new(Script::Write(b"j"));

        Optimizer::new(&config, &runner).optimize_jpeg(&file, Some(StripMode::Color), 90);

        assert_eq!(runner.programs(), ["/opt/jpegoptim"]);
        assert_eq!(
            &runner.args(0)[..5],
            ["-T0.0", "--all-progressive", "-f", "--strip-icc", "-p"]
        );
    }

    #[test]
    fn strip_flag_table() {
        assert_eq!(jpegoptim_strip_flags(Some(StripMode::All)), ["-f", "--strip-all"]);
        assert_eq!(
            jpegoptim_strip_flags(Some(StripMode::Info)),
            ["-f", "--strip-com", "--strip-exif", "--strip-iptc"]
        );
        assert!(jpegoptim_strip_flags(Some(StripMode::None)).is_empty());
        assert!(jpegoptim_strip_flags(None).is_empty());
    }

    #[test]
    fn cwebp_appends_output_and_input() {
        let dir = TempDir::new().unwrap();
        let file = working_file(&dir, b"jpeg bytes");
        let config = config(&["cwebp"]);
        let runner = ScriptedRunner::new(Script::Write(b"RIFF"));

        let outcome = Optimizer::new(&config, &runner)
            .cwebp(&file, vec![arg("-quiet"), arg("-q"), arg("80")], None)
            .unwrap();

        assert!(outcome.applied);
        let args = runner.args(0);
        assert_eq!(&args[..3], ["-quiet", "-q", "80"]);
        assert_eq!(args[3], "-o");
        assert_eq!(args[5], file.display().to_string());
        assert_eq!(fs::read(&file).unwrap(), b"RIFF");
    }

    #[test]
    fn failed_cwebp_keeps_unrotated_working_file() {
        let dir = TempDir::new().unwrap();
        let original = tagged_jpeg(8, 4, 6);
        let file = working_file(&dir, &original);
        let config = config(&["cwebp"]);
        let runner = ScriptedRunner::new(Script::Fail);

        let outcome = Optimizer::new(&config, &runner)
            .cwebp(&file, Vec::new(), Some(90))
            .unwrap();

        assert!(!outcome.applied);
        let data = fs::read(&file).unwrap();
        assert_eq!(data, original);
        assert_eq!(orientation::read_orientation(&data), Some(6));
        assert_eq!(leftover_temp_files(&dir), 0);
    }

    #[test]
    fn cwebp_reads_rotated_copy() {
        let dir = TempDir::new().unwrap();
        let file = working_file(&dir, &tagged_jpeg(8, 4, 6));
        let config = config(&["cwebp"]);
        let runner = ScriptedRunner::new(Script::Write(b"RIFF"));

        let outcome = Optimizer::new(&config, &runner)
            .cwebp(&file, Vec::new(), Some(90))
            .unwrap();

        assert!(outcome.applied);
        let input = runner.args(0)[2].clone();
        assert_ne!(input, file.display().to_string());
        assert!(input.contains("cwebp-in-"));
        assert_eq!(fs::read(&file).unwrap(), b"RIFF");
        assert_eq!(leftover_temp_files(&dir), 0);
    }

    #[test]
    fn bytes_saved_never_negative() {
        assert_eq!(bytes_saved(100, 60), 40);
        assert_eq!(bytes_saved(60, 100), 0);
    }

    // =========================================================================
    // Process runner
    // =========================================================================

    #[cfg(unix)]
    #[test]
    fn process_runner_reports_exit_status() {
        let runner = ProcessRunner;
        let timeout = Duration::from_secs(5);
        assert_eq!(
            runner.run(Path::new("true"), &[], timeout).unwrap(),
            ToolStatus::Success
        );
        assert_eq!(
            runner.run(Path::new("false"), &[], timeout).unwrap(),
            ToolStatus::Failed(Some(1))
        );
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_kills_after_deadline() {
        let started = Instant::now();
        let status = ProcessRunner
            .run(Path::new("sleep"), &[arg("5")], Duration::from_millis(50))
            .unwrap();
        assert_eq!(status, ToolStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_binary_is_an_error() {
        let result = ProcessRunner.run(
            Path::new("/nonexistent/optimizer-binary"),
            &[],
            Duration::from_secs(1),
        );
        assert!(result.is_err());
    }
}

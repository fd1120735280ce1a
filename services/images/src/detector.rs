use crate::config::AnalyzerConfig;
use crate::error::DetectionError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// Output of one successful analyzer run
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerRun {
    /// The `exp*` directory holding the result file and annotated image
    pub output_dir: PathBuf,
    /// Result JSON inside `output_dir`
    pub result_file: PathBuf,
}

/// Runs object detection on a stored image
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Analyze `image` and return where the run wrote its output
    async fn analyze(&self, image: &Path) -> Result<AnalyzerRun, DetectionError>;
}

/// Analyzer backed by an external YOLO-style detection script
pub struct YoloAnalyzer {
    config: AnalyzerConfig,
    permits: Arc<Semaphore>,
}

impl YoloAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self { config, permits }
    }

    fn command(&self, image: &Path) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.arg(&self.config.script)
            .arg("--weights")
            .arg(&self.config.weights)
            .arg("--img")
            .arg(self.config.image_size.to_string())
            .arg("--conf")
            .arg(self.config.confidence.to_string())
            .arg("--source")
            .arg(image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Analyzer for YoloAnalyzer {
    #[instrument(skip(self), fields(image = %image.display()))]
    async fn analyze(&self, image: &Path) -> Result<AnalyzerRun, DetectionError> {
        // Runs share one output root; the permit keeps "newest exp dir" unambiguous
        let queue_timeout = self.config.queue_timeout();
        let _permit = tokio::time::timeout(queue_timeout, self.permits.acquire())
            .await
            .map_err(|_| {
                warn!(queue_timeout_secs = queue_timeout.as_secs(), "No analyzer slot freed up");
                DetectionError::Timeout(queue_timeout)
            })?
            .map_err(|_| DetectionError::Spawn(std::io::Error::other("analyzer permits closed")))?;

        let timeout = self.config.timeout();
        let started = Instant::now();

        let child = self.command(image).spawn().map_err(DetectionError::Spawn)?;

        // Dropping the future on timeout drops the child, which kills it
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                warn!(timeout_secs = timeout.as_secs(), "Analyzer timed out");
                DetectionError::Timeout(timeout)
            })?
            .map_err(DetectionError::Spawn)?;

        let elapsed = started.elapsed();
        metrics::histogram!("images.detection.duration_ms").record(elapsed.as_millis() as f64);

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(DetectionError::Exited {
                status: output.status.to_string(),
                output: combined.trim().to_string(),
            });
        }

        let output_dir = find_latest_exp_dir(&self.config.output_dir).await?;
        let result_file = output_dir.join(&self.config.result_file);

        info!(
            output_dir = %output_dir.display(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Analyzer finished"
        );

        Ok(AnalyzerRun {
            output_dir,
            result_file,
        })
    }
}

/// Parse the numeric suffix of an `exp<digits>` directory name
fn exp_number(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("exp")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Find the `exp<N>` directory with the highest N under `root`
///
/// Suffixes compare numerically, so `exp10` beats `exp9`. A bare `exp`
/// and anything else that is not `exp` followed by digits is ignored.
pub async fn find_latest_exp_dir(root: &Path) -> Result<PathBuf, DetectionError> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .map_err(|source| DetectionError::Read {
            path: root.to_path_buf(),
            source,
        })?;

    let mut latest: Option<(u64, PathBuf)> = None;

    loop {
        let entry = entries
            .next_entry()
            .await
            .map_err(|source| DetectionError::Read {
                path: root.to_path_buf(),
                source,
            })?;
        let Some(entry) = entry else { break };

        let Some(number) = entry.file_name().to_str().and_then(exp_number) else {
            continue;
        };
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }

        if latest.as_ref().map_or(true, |(best, _)| number > *best) {
            latest = Some((number, entry.path()));
        }
    }

    latest
        .map(|(_, path)| path)
        .ok_or_else(|| DetectionError::OutputNotFound(root.to_path_buf()))
}

/// Find the annotated image the analyzer wrote for `source`
///
/// The analyzer keeps the source file name; if that file is missing the
/// first non-JSON file by name is used.
pub async fn locate_annotated_image(
    output_dir: &Path,
    source: &Path,
) -> Result<PathBuf, DetectionError> {
    if let Some(name) = source.file_name() {
        let candidate = output_dir.join(name);
        if tokio::fs::metadata(&candidate)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            return Ok(candidate);
        }
    }

    let mut entries = tokio::fs::read_dir(output_dir)
        .await
        .map_err(|source| DetectionError::Read {
            path: output_dir.to_path_buf(),
            source,
        })?;

    let mut candidates = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        let is_json = path.extension().map_or(false, |ext| ext == "json");
        if is_file && !is_json && path.extension().is_some() {
            candidates.push(path);
        }
    }
    candidates.sort();

    debug!(count = candidates.len(), "Annotated image candidates");

    candidates
        .into_iter()
        .next()
        .ok_or_else(|| DetectionError::AnnotatedImageNotFound(output_dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    #[test]
    fn test_exp_number() {
        assert_eq!(exp_number("exp1"), Some(1));
        assert_eq!(exp_number("exp10"), Some(10));
        assert_eq!(exp_number("exp"), None);
        assert_eq!(exp_number("expX"), None);
        assert_eq!(exp_number("exp1a"), None);
        assert_eq!(exp_number("exp+1"), None);
        assert_eq!(exp_number("run3"), None);
    }

    #[tokio::test]
    async fn test_latest_exp_dir_is_numeric_not_lexicographic() {
        let root = tempfile::tempdir().unwrap();
        for name in ["exp", "exp1", "exp2", "exp9", "exp10", "expX"] {
            fs::create_dir(root.path().join(name)).unwrap();
        }
        // Files never count, even with a higher number
        fs::write(root.path().join("exp99"), b"").unwrap();

        let latest = find_latest_exp_dir(root.path()).await.unwrap();
        assert_eq!(latest, root.path().join("exp10"));
    }

    #[tokio::test]
    async fn test_no_exp_dir_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("exp")).unwrap();
        fs::create_dir(root.path().join("expX")).unwrap();

        let err = find_latest_exp_dir(root.path()).await.unwrap_err();
        assert!(matches!(err, DetectionError::OutputNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_output_root_is_read_error() {
        let root = tempfile::tempdir().unwrap();
        let err = find_latest_exp_dir(&root.path().join("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, DetectionError::Read { .. }));
    }

    #[tokio::test]
    async fn test_locate_annotated_image_prefers_source_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("detections.json"), b"{}").unwrap();
        fs::write(dir.path().join("000.jpg"), b"other").unwrap();
        fs::write(dir.path().join("123.jpg"), b"annotated").unwrap();

        let found = locate_annotated_image(dir.path(), Path::new("/uploads/123.jpg"))
            .await
            .unwrap();
        assert_eq!(found, dir.path().join("123.jpg"));
    }

    #[tokio::test]
    async fn test_locate_annotated_image_falls_back_to_non_json() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("detections.json"), b"{}").unwrap();
        fs::write(dir.path().join("b.png"), b"b").unwrap();
        fs::write(dir.path().join("a.png"), b"a").unwrap();

        let found = locate_annotated_image(dir.path(), Path::new("/uploads/x.jpg"))
            .await
            .unwrap();
        assert_eq!(found, dir.path().join("a.png"));
    }

    #[tokio::test]
    async fn test_locate_annotated_image_requires_an_image() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("detections.json"), b"{}").unwrap();

        let err = locate_annotated_image(dir.path(), Path::new("/uploads/x.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, DetectionError::AnnotatedImageNotFound(_)));
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;

        /// Analyzer config that runs `script` through `sh`
        fn sh_config(root: &Path, script: &str, timeout_secs: u64) -> AnalyzerConfig {
            let script_path = root.join("detect.sh");
            fs::write(&script_path, script).unwrap();
            AnalyzerConfig {
                program: PathBuf::from("sh"),
                script: script_path,
                weights: root.join("weights.pt"),
                output_dir: root.join("runs"),
                timeout_secs,
                ..AnalyzerConfig::default()
            }
        }

        #[tokio::test]
        async fn test_successful_run_returns_latest_output() {
            let root = tempfile::tempdir().unwrap();
            fs::create_dir_all(root.path().join("runs/exp2")).unwrap();
            let script = format!(
                "test \"$1\" = --weights || exit 9\n\
                 test \"$7\" = --source || exit 9\n\
                 mkdir -p {}/runs/exp11\n",
                root.path().display()
            );
            let analyzer = YoloAnalyzer::new(sh_config(root.path(), &script, 10));

            let run = analyzer.analyze(Path::new("/tmp/cat.jpg")).await.unwrap();
            assert_eq!(run.output_dir, root.path().join("runs/exp11"));
            assert_eq!(run.result_file, root.path().join("runs/exp11/detections.json"));
        }

        #[tokio::test]
        async fn test_non_zero_exit_is_error_with_output() {
            let root = tempfile::tempdir().unwrap();
            let analyzer = YoloAnalyzer::new(sh_config(
                root.path(),
                "echo model exploded >&2\nexit 3\n",
                10,
            ));

            let err = analyzer.analyze(Path::new("/tmp/cat.jpg")).await.unwrap_err();
            match err {
                DetectionError::Exited { output, .. } => assert!(output.contains("model exploded")),
                other => panic!("expected Exited, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_slow_analyzer_times_out() {
            let root = tempfile::tempdir().unwrap();
            let analyzer = YoloAnalyzer::new(sh_config(root.path(), "sleep 5\n", 1));

            let err = analyzer.analyze(Path::new("/tmp/cat.jpg")).await.unwrap_err();
            assert!(matches!(err, DetectionError::Timeout(_)));
        }

        #[tokio::test]
        async fn test_wait_for_busy_analyzer_is_bounded() {
            let root = tempfile::tempdir().unwrap();
            fs::create_dir_all(root.path().join("runs")).unwrap();
            let mut config = sh_config(root.path(), "sleep 3\n", 10);
            config.queue_timeout_secs = 1;
            let analyzer = YoloAnalyzer::new(config);

            let started = Instant::now();
            let (first, second) = tokio::join!(
                analyzer.analyze(Path::new("/tmp/cat.jpg")),
                analyzer.analyze(Path::new("/tmp/dog.jpg")),
            );

            // The first run holds the only slot; the second gives up waiting
            assert!(matches!(first, Err(DetectionError::OutputNotFound(_))));
            assert!(matches!(second, Err(DetectionError::Timeout(t)) if t == Duration::from_secs(1)));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn test_missing_program_is_spawn_error() {
            let root = tempfile::tempdir().unwrap();
            let mut config = sh_config(root.path(), "", 10);
            config.program = root.path().join("no-such-python");
            let analyzer = YoloAnalyzer::new(config);

            let err = analyzer.analyze(Path::new("/tmp/cat.jpg")).await.unwrap_err();
            assert!(matches!(err, DetectionError::Spawn(_)));
        }

        #[tokio::test]
        async fn test_success_without_output_dir_is_not_found() {
            let root = tempfile::tempdir().unwrap();
            fs::create_dir_all(root.path().join("runs")).unwrap();
            let analyzer = YoloAnalyzer::new(sh_config(root.path(), "exit 0\n", 10));

            let err = analyzer.analyze(Path::new("/tmp/cat.jpg")).await.unwrap_err();
            assert!(matches!(err, DetectionError::OutputNotFound(_)));
        }
    }
}

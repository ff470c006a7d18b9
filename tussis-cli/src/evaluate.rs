//! Corpus evaluation: classify `DIR/<label>/*.wav` and score the results.
//!
//! ```text
//! collect_corpus() ─► bounded job channel ─► N workers (shared Arc<TussisEngine>)
//!                                                 │
//!                                         Mutex<Tally> ─► EvaluationReport
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use tussis_core::{Classification, TussisEngine, TussisError};

/// Column used in the confusion matrix for clips that produced no class.
pub const UNCLASSIFIABLE: &str = "<unclassifiable>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelledClip {
    pub label: String,
    pub path: PathBuf,
}

/// Every `*.wav` under `root/<label>/`, sorted by label then file name.
pub fn collect_corpus(root: &Path) -> Result<Vec<LabelledClip>> {
    let mut label_dirs: Vec<PathBuf> = fs::read_dir(root)
        .with_context(|| format!("reading corpus {}", root.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    label_dirs.sort();

    let mut clips = Vec::new();
    for dir in label_dirs {
        let Some(label) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
            })
            .collect();
        files.sort();
        clips.extend(files.into_iter().map(|path| LabelledClip {
            label: label.clone(),
            path,
        }));
    }
    if clips.is_empty() {
        bail!("no .wav files found under {}/<label>/", root.display());
    }
    Ok(clips)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LabelStats {
    pub total: usize,
    pub correct: usize,
    pub unclassifiable: usize,
    pub errors: usize,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub total: usize,
    pub classified: usize,
    pub correct: usize,
    /// Correct over classified clips.
    pub accuracy: f64,
    pub per_label: BTreeMap<String, LabelStats>,
    /// expected label → predicted label → count
    pub confusion: BTreeMap<String, BTreeMap<String, usize>>,
    pub failures: Vec<FailedClip>,
    pub latency: LatencySummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedClip {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Default)]
struct Tally {
    per_label: BTreeMap<String, LabelStats>,
    confusion: BTreeMap<String, BTreeMap<String, usize>>,
    failures: Vec<FailedClip>,
    latencies_ms: Vec<f64>,
}

impl Tally {
    fn record(&mut self, clip: &LabelledClip, result: &Result<Classification, TussisError>, elapsed_ms: f64) {
        self.latencies_ms.push(elapsed_ms);
        let stats = self.per_label.entry(clip.label.clone()).or_default();
        stats.total += 1;

        let predicted = match result {
            Ok(classification) => match &classification.diagnostics.label {
                Some(label) if classification.is_classified() => label.clone(),
                _ => {
                    stats.unclassifiable += 1;
                    UNCLASSIFIABLE.to_string()
                }
            },
            Err(e) => {
                stats.errors += 1;
                self.failures.push(FailedClip {
                    path: clip.path.clone(),
                    error: e.to_string(),
                });
                return;
            }
        };
        if predicted == clip.label {
            stats.correct += 1;
        }
        *self
            .confusion
            .entry(clip.label.clone())
            .or_default()
            .entry(predicted)
            .or_default() += 1;
    }

    fn finish(mut self) -> EvaluationReport {
        let mut total = 0;
        let mut classified = 0;
        let mut correct = 0;
        for stats in self.per_label.values_mut() {
            let scored = stats.total - stats.unclassifiable - stats.errors;
            stats.accuracy = ratio(stats.correct, scored);
            total += stats.total;
            classified += scored;
            correct += stats.correct;
        }

        self.latencies_ms.sort_by(f64::total_cmp);
        let latency = LatencySummary {
            p50_ms: percentile(&self.latencies_ms, 50.0),
            p95_ms: percentile(&self.latencies_ms, 95.0),
            max_ms: self.latencies_ms.last().copied().unwrap_or(0.0),
        };

        EvaluationReport {
            total,
            classified,
            correct,
            accuracy: ratio(correct, classified),
            per_label: self.per_label,
            confusion: self.confusion,
            failures: self.failures,
            latency,
        }
    }
}

fn ratio(n: usize, d: usize) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

/// Nearest-rank percentile of an ascending slice.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Classify every clip on `workers` threads sharing one engine.
pub fn evaluate(engine: Arc<TussisEngine>, clips: Vec<LabelledClip>, workers: usize) -> EvaluationReport {
    let workers = workers.clamp(1, clips.len().max(1));
    let total = clips.len();
    let (job_tx, job_rx) = crossbeam_channel::bounded::<LabelledClip>(workers * 2);
    let tally = Arc::new(Mutex::new(Tally::default()));
    let started = Instant::now();
    info!(clips = total, workers, "evaluation started");

    thread::scope(|scope| {
        for worker in 0..workers {
            let job_rx = job_rx.clone();
            let engine = Arc::clone(&engine);
            let tally = Arc::clone(&tally);
            scope.spawn(move || {
                for clip in job_rx.iter() {
                    let t0 = Instant::now();
                    let result = engine.classify_file(&clip.path);
                    let elapsed_ms = t0.elapsed().as_secs_f64() * 1_000.0;
                    if let Err(e) = &result {
                        warn!(worker, path = %clip.path.display(), error = %e, "clip failed");
                    } else {
                        debug!(worker, path = %clip.path.display(), elapsed_ms, "clip done");
                    }
                    tally.lock().record(&clip, &result, elapsed_ms);
                }
            });
        }
        drop(job_rx);
        for clip in clips {
            if job_tx.send(clip).is_err() {
                break;
            }
        }
        drop(job_tx);
    });

    let tally = std::mem::take(&mut *tally.lock());
    let report = tally.finish();
    info!(
        clips = report.total,
        accuracy = report.accuracy,
        elapsed_s = started.elapsed().as_secs_f64(),
        "evaluation finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tussis_core::audio::denoise::DenoiseMode;
    use tussis_core::inference::stub::StubClassifier;
    use tussis_core::{ModelHandle, ModelManifest, ModelRegistry, PipelineConfig};

    const LABELS: [&str; 2] = ["covid", "healthy"];

    fn write_clip(path: &Path, seconds: f32, amplitude: f32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let n = (seconds * 16_000.0) as usize;
        for i in 0..n {
            let s = amplitude * (2.0 * std::f32::consts::PI * 300.0 * i as f32 / 16_000.0).sin();
            writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn engine() -> Arc<TussisEngine> {
        let config = PipelineConfig {
            denoise: DenoiseMode::None,
            ..PipelineConfig::default()
        };
        let model = StubClassifier::fixed("m", ModelManifest::with_labels(LABELS), vec![2.0, 0.0]);
        let registry = ModelRegistry::from_handles(vec![ModelHandle::new(model)], &config).unwrap();
        Arc::new(TussisEngine::new(config, registry).unwrap())
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let values: Vec<f64> = (1..=20).map(f64::from).collect();
        assert_eq!(percentile(&values, 50.0), 10.0);
        assert_eq!(percentile(&values, 95.0), 19.0);
        assert_eq!(percentile(&values, 100.0), 20.0);
        assert_eq!(percentile(&[3.0], 95.0), 3.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn corpus_is_collected_per_label_directory() {
        let dir = tempfile::tempdir().unwrap();
        for (label, file) in [("healthy", "b.wav"), ("covid", "a.WAV"), ("healthy", "a.wav")] {
            fs::create_dir_all(dir.path().join(label)).unwrap();
            fs::write(dir.path().join(label).join(file), b"").unwrap();
        }
        fs::write(dir.path().join("healthy").join("notes.txt"), b"").unwrap();
        fs::write(dir.path().join("stray.wav"), b"").unwrap();

        let clips = collect_corpus(dir.path()).unwrap();
        let found: Vec<(String, String)> = clips
            .iter()
            .map(|c| {
                (
                    c.label.clone(),
                    c.path.file_name().unwrap().to_string_lossy().into_owned(),
                )
            })
            .collect();
        assert_eq!(
            found,
            vec![
                ("covid".into(), "a.WAV".into()),
                ("healthy".into(), "a.wav".into()),
                ("healthy".into(), "b.wav".into()),
            ]
        );
    }

    #[test]
    fn empty_corpus_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("covid")).unwrap();
        assert!(collect_corpus(dir.path()).is_err());
    }

    #[test]
    fn report_scores_every_clip() {
        let dir = tempfile::tempdir().unwrap();
        for label in LABELS {
            fs::create_dir_all(dir.path().join(label)).unwrap();
        }
        write_clip(&dir.path().join("covid").join("1.wav"), 1.5, 0.5);
        write_clip(&dir.path().join("covid").join("2.wav"), 2.0, 0.3);
        write_clip(&dir.path().join("healthy").join("1.wav"), 1.5, 0.4);
        write_clip(&dir.path().join("healthy").join("short.wav"), 0.4, 0.4);
        fs::write(dir.path().join("healthy").join("corrupt.wav"), b"RIFF").unwrap();

        let clips = collect_corpus(dir.path()).unwrap();
        let report = evaluate(engine(), clips, 3);

        assert_eq!(report.total, 5);
        assert_eq!(report.classified, 3);
        assert_eq!(report.correct, 2);
        assert!((report.accuracy - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.per_label["covid"].accuracy, 1.0);
        assert_eq!(report.per_label["healthy"].unclassifiable, 1);
        assert_eq!(report.per_label["healthy"].errors, 1);
        assert_eq!(report.confusion["healthy"]["covid"], 1);
        assert_eq!(report.confusion["healthy"][UNCLASSIFIABLE], 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.latency.p95_ms >= report.latency.p50_ms);
        assert!(report.latency.max_ms >= report.latency.p95_ms);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["per_label"]["covid"]["correct"], 2);
    }
}

use crate::evaluation::{Evaluate, EvaluationContext, EvaluationError, EvaluationResult, RunRequest};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Requests one run per file in `dir` modified after the cursor.
///
/// The cursor is the newest modification time seen, in milliseconds since the
/// epoch. Each request's run key is `"{path}:{mtime_ms}"`, so a rewritten file
/// triggers again while a re-evaluated one does not.
#[derive(Debug, Clone)]
pub struct DirectorySensorEvaluator {
    dir: PathBuf,
    run_config: serde_json::Value,
}

impl DirectorySensorEvaluator {
    pub fn new(dir: impl Into<PathBuf>, run_config: serde_json::Value) -> Self {
        Self {
            dir: dir.into(),
            run_config,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn config_for(&self, path: &Path) -> serde_json::Value {
        let mut config = match &self.run_config {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        config.insert(
            "path".to_string(),
            serde_json::Value::String(path.display().to_string()),
        );
        serde_json::Value::Object(config)
    }
}

impl Evaluate for DirectorySensorEvaluator {
    fn evaluate(&self, ctx: &EvaluationContext) -> Result<EvaluationResult, EvaluationError> {
        let since: i64 = match ctx.cursor.as_deref() {
            None | Some("") => i64::MIN,
            Some(c) => c.parse().map_err(|_| {
                EvaluationError::malformed(format!("cursor '{c}' is not a millisecond timestamp"))
            })?,
        };

        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            EvaluationError::raised(format!("cannot read {}: {e}", self.dir.display()))
        })?;

        let mut fresh: Vec<(i64, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| EvaluationError::raised(e.to_string()))?;
            let meta = entry
                .metadata()
                .map_err(|e| EvaluationError::raised(e.to_string()))?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .map_err(|e| EvaluationError::raised(e.to_string()))?;
            let mtime_ms = modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            if mtime_ms > since {
                fresh.push((mtime_ms, entry.path()));
            }
        }

        if fresh.is_empty() {
            return Ok(EvaluationResult::skip(format!(
                "no new files in {}",
                self.dir.display()
            )));
        }
        fresh.sort();

        let newest = fresh.iter().map(|(m, _)| *m).max().unwrap_or(since);
        let run_requests = fresh
            .iter()
            .map(|(mtime_ms, path)| {
                RunRequest::keyed(format!("{}:{mtime_ms}", path.display()))
                    .with_run_config(self.config_for(path))
            })
            .collect();
        Ok(EvaluationResult::requests(run_requests).with_cursor(newest.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{InstigatorId, InstigatorType};
    use chrono::Utc;
    use tempfile::TempDir;

    fn ctx(cursor: Option<String>) -> EvaluationContext {
        EvaluationContext {
            instigator: InstigatorId::new("etl", "repo", "inbox").unwrap(),
            instigator_type: InstigatorType::Sensor,
            job_name: "ingest".into(),
            scheduled_for: None,
            cursor,
            last_evaluated_at: None,
            evaluation_time: Utc::now(),
        }
    }

    #[test]
    fn first_pass_sees_every_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.csv"), "1").unwrap();
        std::fs::write(dir.path().join("b.csv"), "2").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let eval = DirectorySensorEvaluator::new(dir.path(), serde_json::json!({"mode": "fast"}));
        let result = eval.evaluate(&ctx(None)).unwrap();
        assert_eq!(result.run_requests.len(), 2);
        assert!(result.cursor.is_some());
        let cfg = &result.run_requests[0].run_config;
        assert_eq!(cfg["mode"], "fast");
        assert!(cfg["path"].as_str().unwrap().ends_with(".csv"));
    }

    #[test]
    fn cursor_filters_seen_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.csv"), "1").unwrap();
        let eval = DirectorySensorEvaluator::new(dir.path(), serde_json::Value::Null);

        let first = eval.evaluate(&ctx(None)).unwrap();
        let second = eval.evaluate(&ctx(first.cursor.clone())).unwrap();
        assert!(second.run_requests.is_empty());
        assert!(second.skip_reason.is_some());
        assert_eq!(second.cursor, None);
    }

    #[test]
    fn run_key_carries_mtime() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.csv"), "1").unwrap();
        let eval = DirectorySensorEvaluator::new(dir.path(), serde_json::Value::Null);
        let result = eval.evaluate(&ctx(None)).unwrap();
        let key = result.run_requests[0].run_key.clone().unwrap();
        assert!(key.ends_with(&format!(":{}", result.cursor.unwrap())));
    }

    #[test]
    fn missing_dir_raises() {
        let eval = DirectorySensorEvaluator::new("/nonexistent/instigate/inbox", serde_json::Value::Null);
        assert!(eval.evaluate(&ctx(None)).is_err());
    }

    #[test]
    fn garbage_cursor_is_malformed() {
        let dir = TempDir::new().unwrap();
        let eval = DirectorySensorEvaluator::new(dir.path(), serde_json::Value::Null);
        let err = eval.evaluate(&ctx(Some("yesterday".into()))).unwrap_err();
        assert_eq!(err.kind, crate::evaluation::EvaluationErrorKind::Malformed);
    }
}

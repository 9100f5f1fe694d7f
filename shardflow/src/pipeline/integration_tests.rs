//! End-to-end tests: runner, dispatcher and aggregator over a mock backend.

#[cfg(test)]
mod tests {
    use crate::aggregate::Aggregator;
    use crate::backend::CommandSpec;
    use crate::config::{RunConfig, StageRange};
    use crate::dispatch::{JobDispatcher, StageTask};
    use crate::errors::{ShardflowError, ShardflowResult};
    use crate::events::CollectingEventSink;
    use crate::manifest::WorkManifest;
    use crate::pipeline::{
        PipelineBuilder, RunReport, Stage, StageContext, StageOutput, StageRunner,
    };
    use crate::testing::{MockBackend, RecordingStage};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Shards a manifest, then merges the per-shard `text` files.
    #[derive(Debug)]
    struct DecodeStage {
        manifest: Arc<WorkManifest>,
        merges: AtomicUsize,
    }

    impl DecodeStage {
        fn new(manifest: WorkManifest) -> Self {
            Self {
                manifest: Arc::new(manifest),
                merges: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Stage for DecodeStage {
        fn name(&self) -> &str {
            "decode"
        }

        async fn execute(&self, ctx: &StageContext) -> ShardflowResult<StageOutput> {
            let dir = ctx.artifact_dir("decode", "beam20");
            let command = CommandSpec::new("decode.sh").arg("{keys}").arg("{outdir}");
            let task = StageTask::new("decode", command, dir.join("logdir"))
                .with_manifest(Arc::clone(&self.manifest))
                .with_parallelism(ctx.config().parallelism_for("decode"));

            let input = ctx.run_task(&task).await?;
            self.merges.fetch_add(1, Ordering::SeqCst);
            let artifact = Aggregator::stream("text")
                .with_coverage_check()
                .merge(&input, &dir, "beam20")?
                .with_stage(ctx.stage_id());
            Ok(StageOutput::ok().with_artifact(artifact))
        }
    }

    /// Copies the shard's key file to `<outdir>/text`.
    fn echo_keys() -> MockBackend {
        MockBackend::new().with_job(|cmd| {
            std::fs::copy(&cmd.args[0], Path::new(&cmd.args[1]).join("text")).map(|_| ())
        })
    }

    struct Run {
        result: ShardflowResult<RunReport>,
        backend: Arc<MockBackend>,
        events: Arc<CollectingEventSink>,
        decode: Arc<DecodeStage>,
        score: Arc<RecordingStage>,
    }

    async fn run_decode(
        exp_root: &Path,
        manifest: WorkManifest,
        config: RunConfig,
        backend: MockBackend,
    ) -> Run {
        let backend = Arc::new(backend);
        let events = Arc::new(CollectingEventSink::new());
        let decode = Arc::new(DecodeStage::new(manifest));
        let score = Arc::new(RecordingStage::new("score"));

        let pipeline = PipelineBuilder::new("asr")
            .stage(10, decode.clone())
            .unwrap()
            .stage(11, score.clone())
            .unwrap()
            .build();
        let dispatcher = JobDispatcher::new(backend.clone()).with_events(events.clone());
        let mut runner = StageRunner::new(
            pipeline,
            Arc::new(config.with_exp_root(exp_root)),
            Arc::new(dispatcher),
        )
        .with_events(events.clone());

        Run {
            result: runner.run().await,
            backend,
            events,
            decode,
            score,
        }
    }

    fn utterances() -> WorkManifest {
        WorkManifest::parse("text", "u2 b\nu3 c\nu1 a\n").unwrap()
    }

    #[tokio::test]
    async fn test_merged_output_does_not_depend_on_parallelism() {
        let mut outputs = Vec::new();
        for parallelism in [1, 2, 3, 8] {
            let exp = tempfile::tempdir().unwrap();
            let config = RunConfig::default().with_parallelism(parallelism);
            let run = run_decode(exp.path(), utterances(), config, echo_keys()).await;

            let report = run.result.unwrap();
            assert_eq!(report.executed_ids(), vec![10, 11]);
            let artifact = &report.executed[0].artifacts[0];
            outputs.push(std::fs::read_to_string(artifact.join("text")).unwrap());
        }

        for output in &outputs {
            assert_eq!(output, "u1 a\nu2 b\nu3 c\n");
        }
    }

    #[tokio::test]
    async fn test_parallelism_above_item_count_submits_one_job_per_item() {
        let exp = tempfile::tempdir().unwrap();
        let manifest = WorkManifest::from_ids("m", (1..=5).map(|i| format!("u{i}"))).unwrap();
        let run = run_decode(exp.path(), manifest, RunConfig::default(), echo_keys()).await;

        run.result.unwrap();
        assert_eq!(run.backend.total_jobs(), 5);
        assert_eq!(run.events.of_type("shard.completed").len(), 5);
        assert!(exp.path().join("decode_beam20/logdir/split5/keys.5.scp").is_file());
    }

    #[tokio::test]
    async fn test_failed_shard_stops_before_aggregation() {
        let exp = tempfile::tempdir().unwrap();
        let manifest = WorkManifest::from_ids("m", ["u1", "u2", "u3", "u4"]).unwrap();
        let config = RunConfig::default().with_parallelism(4);
        let run = run_decode(exp.path(), manifest, config, echo_keys().failing_on([2])).await;

        let err = run.result.unwrap_err();
        assert!(matches!(err, ShardflowError::StageFailed { stage_id: 10, .. }));
        let ShardflowError::ShardJobFailure(failure) = err.root_cause() else {
            panic!("expected shard failure, got {err}");
        };
        assert_eq!(failure.failed_indices(), vec![2]);

        assert_eq!(run.decode.merges.load(Ordering::SeqCst), 0);
        assert_eq!(run.score.call_count(), 0);
        assert!(!exp.path().join("decode_beam20/text").exists());
        assert!(exp.path().join("decode_beam20/logdir/output.1/text").is_file());
        assert_eq!(run.events.of_type("shard.failed").len(), 1);
    }

    #[tokio::test]
    async fn test_rerun_of_later_stage_only() {
        let exp = tempfile::tempdir().unwrap();
        let config = RunConfig::default().with_stage_range(StageRange::only(11));
        let run = run_decode(exp.path(), utterances(), config, echo_keys()).await;

        assert_eq!(run.result.unwrap().executed_ids(), vec![11]);
        assert_eq!(run.backend.submissions(), 0);
        assert_eq!(run.score.recorded_ids(), vec![11]);
    }
}

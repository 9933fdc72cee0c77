//! Benchmarks for the scheduler's execution loop.
//!
//! These benchmarks measure the cost of driving a full run to completion for
//! a few representative pipeline shapes:
//! - A linear chain of `Next` steps
//! - A map fan-out over N workers joined by a barrier
//! - A sub-pipeline delegation

use std::sync::Arc;

use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use futures_util::StreamExt;
use tokio::runtime::Runtime;
use workweave::scheduler::{Pipeline, PipelineBuilder, PipelineRunner};
use workweave::step::{Directive, Step, StepConfig, StepError, StepKind, StepPayload};

struct NextStep(String);

#[async_trait]
impl Step<(), ()> for NextStep {
    async fn call(&self, _s: Arc<()>, _c: Arc<()>, _p: StepPayload) -> Result<Directive, StepError> {
        Ok(Directive::Next(self.0.clone()))
    }
}

struct StopStep;

#[async_trait]
impl Step<(), ()> for StopStep {
    async fn call(&self, _s: Arc<()>, _c: Arc<()>, _p: StepPayload) -> Result<Directive, StepError> {
        Ok(Directive::Stop)
    }
}

struct FanOutStep(usize);

#[async_trait]
impl Step<(), ()> for FanOutStep {
    async fn call(&self, _s: Arc<()>, _c: Arc<()>, _p: StepPayload) -> Result<Directive, StepError> {
        let items: Vec<serde_json::Value> = (0..self.0).map(|i| serde_json::json!(i)).collect();
        Ok(Directive::Value(serde_json::Value::Array(items)))
    }
}

fn build_linear_pipeline(step_count: usize) -> Arc<Pipeline<(), ()>> {
    let mut builder: PipelineBuilder<(), ()> = PipelineBuilder::new("bench-linear");
    for i in 0..step_count {
        let name = format!("step_{i}");
        if i + 1 < step_count {
            let next = format!("step_{}", i + 1);
            builder.add_step(StepConfig::new(&name, StepKind::Step).with_to(vec![next.clone()]), Arc::new(NextStep(next))).unwrap();
        } else {
            builder.add_step(StepConfig::new(&name, StepKind::Step), Arc::new(StopStep)).unwrap();
        }
    }
    Arc::new(builder.build().expect("linear pipeline compiles"))
}

fn build_fanout_pipeline(width: usize) -> Arc<Pipeline<(), ()>> {
    let mut builder: PipelineBuilder<(), ()> = PipelineBuilder::new("bench-fanout");
    builder.add_step(StepConfig::new("split", StepKind::Map).with_map_target("worker"), Arc::new(FanOutStep(width))).unwrap();
    builder.add_step(StepConfig::new("worker", StepKind::Step), Arc::new(StopStep)).unwrap();
    Arc::new(builder.build().expect("fanout pipeline compiles"))
}

async fn drive(pipeline: Arc<Pipeline<(), ()>>) -> usize {
    let runner = PipelineRunner::new(pipeline);
    runner.run(Arc::new(()), Arc::new(()), None).count().await
}

fn bench_linear_run(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("scheduler_linear_run");

    for size in [10, 50, 200] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(&runtime).iter(|| async move {
                let pipeline = build_linear_pipeline(size);
                drive(pipeline).await
            });
        });
    }

    group.finish();
}

fn bench_fanout_run(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("scheduler_fanout_run");

    for width in [8, 64, 256] {
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            b.to_async(&runtime).iter(|| async move {
                let pipeline = build_fanout_pipeline(width);
                drive(pipeline).await
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_linear_run, bench_fanout_run);
criterion_main!(benches);

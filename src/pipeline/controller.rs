// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use super::job::{Job, JobFuture, StartupSignal};
use crate::error::{DetectorError, FatalError};

/// 模型相关的批处理策略
///
/// 调度器本身只负责排队、分批和生命周期；预处理和 worker 循环由策略提供。
/// `preprocess` 在提交线程上执行，`worker` 在调度器创建的唯一 worker 线程上执行。
pub trait BatchStrategy: Send + Sync + 'static {
    type Input: Sync;
    type Output: Default + Send + 'static;
    type StartParam: Send + 'static;
    type Additional: Default + Send + 'static;

    /// 预处理一个输入，失败时返回 false（作业以默认输出立即完成）
    fn preprocess(&self, job: &mut Job<Self::Output, Self::Additional>, input: &Self::Input) -> bool;

    /// worker 入口：完成初始化后通过 `signal` 报告结果，然后循环处理批次直到队列停止
    fn worker(
        &self,
        queue: &JobQueue<Self::Output, Self::Additional>,
        param: Self::StartParam,
        signal: StartupSignal,
    );

    /// 同时在途的预处理结果上限，`submit_many` 按此分组入队
    fn inflight_capacity(&self) -> usize;
}

/// 作业队列（单一互斥锁 + 条件变量）
pub struct JobQueue<O, A> {
    jobs: Mutex<VecDeque<Job<O, A>>>,
    cond: Condvar,
    running: AtomicBool,
}

impl<O: Default, A> JobQueue<O, A> {
    fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
        }
    }

    /// 等待并按提交顺序取出最多 `max_count` 个作业
    ///
    /// 队列停止后返回 None，worker 应随即退出。
    pub fn get_jobs_and_wait(&self, max_count: usize) -> Option<Vec<Job<O, A>>> {
        let max_count = max_count.max(1);
        let mut jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        loop {
            if !self.is_running() {
                return None;
            }

            if !jobs.is_empty() {
                let count = jobs.len().min(max_count);
                return Some(jobs.drain(..count).collect());
            }

            jobs = self
                .cond
                .wait(jobs)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// 一次加锁压入一组作业；队列已停止时以默认输出完成
    fn push(&self, batch: impl IntoIterator<Item = Job<O, A>>) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !self.is_running() {
            drop(jobs);
            for mut job in batch {
                job.fulfill(O::default());
            }
            return;
        }

        let before = jobs.len();
        jobs.extend(batch);
        let pushed = jobs.len() > before;
        drop(jobs);

        if pushed {
            self.cond.notify_one();
        }
    }

    /// 停止队列，唤醒 worker，并以默认输出完成所有未取出的作业
    fn close(&self) -> usize {
        let drained: Vec<Job<O, A>> = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            self.running.store(false, Ordering::Release);
            jobs.drain(..).collect()
        };
        self.cond.notify_all();

        let count = drained.len();
        for mut job in drained {
            job.fulfill(O::default());
        }
        count
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 尚未被 worker 取出的作业数
    pub fn pending(&self) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// worker 线程退出（含 panic 展开）时关闭队列
struct CloseOnExit<O: Default, A>(Arc<JobQueue<O, A>>);

impl<O: Default, A> Drop for CloseOnExit<O, A> {
    fn drop(&mut self) {
        let drained = self.0.close();
        if thread::panicking() {
            error!("Worker thread panicked, {} queued jobs released", drained);
        }
    }
}

/// 通用批处理调度器
///
/// 多个提交线程作为生产者，唯一的 worker 线程作为消费者；作业严格按提交顺序服务，
/// 每次唤醒最多取出策略指定的批大小。
pub struct InferController<S: BatchStrategy> {
    name: String,
    strategy: Arc<S>,
    queue: Arc<JobQueue<S::Output, S::Additional>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: BatchStrategy> InferController<S> {
    pub fn new(name: impl Into<String>, strategy: S) -> Self {
        Self {
            name: name.into(),
            strategy: Arc::new(strategy),
            queue: Arc::new(JobQueue::new()),
            worker: Mutex::new(None),
        }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// 启动 worker 线程并阻塞到其报告初始化结果
    pub fn startup(&self, param: S::StartParam) -> Result<(), DetectorError> {
        let mut worker = self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if worker.is_some() {
            return Err(DetectorError::NotReady(format!(
                "{} worker already started",
                self.name
            )));
        }
        if !self.queue.is_running() {
            return Err(DetectorError::NotReady(format!("{} is stopped", self.name)));
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let strategy = Arc::clone(&self.strategy);
        let queue = Arc::clone(&self.queue);

        let handle = thread::Builder::new()
            .name(format!("{}-worker", self.name))
            .spawn(move || {
                let _close = CloseOnExit(Arc::clone(&queue));
                strategy.worker(&queue, param, StartupSignal::new(tx));
            })?;

        match rx.recv() {
            Ok(Ok(())) => {
                info!("{} worker started", self.name);
                *worker = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                error!("{} worker failed to start: {}", self.name, e);
                self.queue.close();
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                self.queue.close();
                if let Err(payload) = handle.join()
                    && payload.is::<FatalError>()
                {
                    std::panic::resume_unwind(payload);
                }
                Err(DetectorError::ModelLoadError(format!(
                    "{} worker exited before reporting startup",
                    self.name
                )))
            }
        }
    }

    /// 提交一个输入
    ///
    /// 预处理在当前线程执行；失败时返回已完成的默认结果，不进入队列。
    pub fn submit(&self, input: &S::Input) -> JobFuture<S::Output> {
        let (job, future) = self.prepare(input);
        if let Some(job) = job {
            self.queue.push(std::iter::once(job));
        }
        future
    }

    /// 批量提交，按在途容量分组，每组一次性入队
    pub fn submit_many(&self, inputs: &[S::Input]) -> Vec<JobFuture<S::Output>> {
        let group = self.strategy.inflight_capacity().max(1);
        let mut futures = Vec::with_capacity(inputs.len());

        for chunk in inputs.chunks(group) {
            let mut jobs = Vec::with_capacity(chunk.len());
            for input in chunk {
                let (job, future) = self.prepare(input);
                jobs.extend(job);
                futures.push(future);
            }
            self.queue.push(jobs);
        }

        futures
    }

    fn prepare(
        &self,
        input: &S::Input,
    ) -> (Option<Job<S::Output, S::Additional>>, JobFuture<S::Output>) {
        let (mut job, future) = Job::new();
        if self.strategy.preprocess(&mut job, input) {
            (Some(job), future)
        } else {
            debug!("{} preprocess failed, returning empty result", self.name);
            job.fulfill(S::Output::default());
            (None, future)
        }
    }

    /// 停止调度器：完成所有排队作业并等待 worker 退出，可重复调用
    pub fn stop(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let drained = self.queue.close();
        if drained > 0 {
            debug!("{} released {} queued jobs on stop", self.name, drained);
        }

        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("{} worker terminated abnormally", self.name);
            }
            info!("{} stopped", self.name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.queue.is_running()
    }

    pub fn pending(&self) -> usize {
        self.queue.pending()
    }
}

impl<S: BatchStrategy> Drop for InferController<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

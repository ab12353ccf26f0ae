// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use std::future::Future;
use std::pin::Pin;
use std::sync::mpsc::SyncSender;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::DetectorError;

/// 一次提交对应的作业
///
/// `additional` 保存预处理阶段产生的模型相关数据，worker 取出作业后使用；
/// promise 只会被兑现一次，作业被丢弃而未兑现时，对应的 future 得到默认输出。
pub struct Job<O, A> {
    pub additional: A,
    promise: Option<oneshot::Sender<O>>,
}

impl<O, A: Default> Job<O, A> {
    pub fn new() -> (Self, JobFuture<O>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                additional: A::default(),
                promise: Some(tx),
            },
            JobFuture { rx },
        )
    }
}

impl<O, A> Job<O, A> {
    /// 兑现结果，重复调用无效
    pub fn fulfill(&mut self, output: O) {
        if let Some(promise) = self.promise.take()
            && promise.send(output).is_err()
        {
            trace!("Job result dropped, receiver already gone");
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.promise.is_none()
    }
}

/// 作业结果
///
/// 既可以在异步上下文中 `.await`，也可以在同步线程中 `wait()`。
/// 作业在兑现前被丢弃（停止、worker 异常退出）时得到 `O::default()`。
pub struct JobFuture<O> {
    rx: oneshot::Receiver<O>,
}

impl<O: Default> JobFuture<O> {
    /// 已完成的结果
    pub fn ready(output: O) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(output);
        Self { rx }
    }

    /// 阻塞等待结果
    ///
    /// # Panics
    ///
    /// 在 tokio 运行时的工作线程中调用时 panic；异步上下文请直接 `.await`。
    pub fn wait(self) -> O {
        self.rx.blocking_recv().unwrap_or_default()
    }
}

impl<O: Default> Future for JobFuture<O> {
    type Output = O;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<O> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|result| result.unwrap_or_default())
    }
}

/// worker 启动结果的一次性信号
pub struct StartupSignal {
    tx: SyncSender<Result<(), DetectorError>>,
}

impl StartupSignal {
    pub(crate) fn new(tx: SyncSender<Result<(), DetectorError>>) -> Self {
        Self { tx }
    }

    pub fn ready(self) {
        let _ = self.tx.send(Ok(()));
    }

    pub fn fail(self, error: DetectorError) {
        let _ = self.tx.send(Err(error));
    }
}

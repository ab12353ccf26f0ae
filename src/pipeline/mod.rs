// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 批处理调度
//!
//! 通用的作业调度器：多个提交线程并发预处理并入队，唯一的 worker 线程
//! 按提交顺序成批取出作业。模型相关的逻辑通过 `BatchStrategy` 组合进来。

mod controller;
mod job;

pub use controller::{BatchStrategy, InferController, JobQueue};
pub use job::{Job, JobFuture, StartupSignal};

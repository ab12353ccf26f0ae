// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

pub mod config;
pub mod detector;
pub mod device;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod pipeline;

pub use config::{AppConfig, ConfigLoader, DetectorConfig, LoggingConfig};
pub use detector::{BoxList, DetectionBox, Detector, DetectorKind, Image, create_detector};
pub use device::{DeviceId, MixedMemory, MonopolyPool, Stream, Tensor};
pub use engine::{EngineLoader, InferEngine};
pub use error::{DetectorError, ErrorReporter, FatalError, install_reporter};
pub use pipeline::{BatchStrategy, InferController, JobFuture};

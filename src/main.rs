// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use anyhow::Context;
use batchdet::{AppConfig, BoxList, Detector, DeviceId, Image};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// 批量目标检测
#[derive(Parser, Debug)]
#[command(name = "batchdet", version, about)]
struct Cli {
    /// 配置文件（默认读取当前目录下的 batchdet.toml）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 模型文件，覆盖配置
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// 模型类型（v5 / x），覆盖配置
    #[arg(short, long)]
    kind: Option<String>,

    /// 设备序号，覆盖配置
    #[arg(long)]
    device: Option<u32>,

    /// 置信度阈值，覆盖配置
    #[arg(long)]
    confidence: Option<f32>,

    /// NMS 阈值，覆盖配置
    #[arg(long)]
    nms: Option<f32>,

    /// 待检测的图像
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

#[derive(Serialize)]
struct ImageReport {
    image: String,
    width: usize,
    height: usize,
    boxes: BoxList,
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_with_path(path)?,
        None => AppConfig::load()?,
    };

    if let Some(model) = &cli.model {
        config.detector.model_path = model.clone();
    }
    if let Some(kind) = &cli.kind {
        config.detector.kind = kind.parse()?;
    }
    if let Some(device) = cli.device {
        config.detector.device_id = DeviceId(device);
    }
    if let Some(confidence) = cli.confidence {
        config.detector.confidence_threshold = confidence;
    }
    if let Some(nms) = cli.nms {
        config.detector.nms_threshold = nms;
    }

    config.detector.validate()?;
    Ok(config)
}

fn read_image(path: &PathBuf) -> anyhow::Result<Image> {
    let decoded = image::open(path)
        .with_context(|| format!("Failed to decode {:?}", path))?
        .to_rgb8();
    let (width, height) = decoded.dimensions();
    Ok(Image::from_rgb8(
        width as usize,
        height as usize,
        decoded.into_raw(),
    )?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.logging.ansi)
        .init();

    tracing::info!("Starting batchdet...");
    tracing::debug!("Configuration loaded: {:?}", config);

    let detector_config = config.detector.clone();
    let detector = Arc::new(
        tokio::task::spawn_blocking(move || Detector::from_config(&detector_config)).await??,
    );
    tracing::info!(
        "Detector ready: kind={}, input={:?}",
        detector.kind(),
        detector.input_size()
    );

    let mut names = Vec::with_capacity(cli.images.len());
    let mut images = Vec::with_capacity(cli.images.len());
    for path in &cli.images {
        match read_image(path) {
            Ok(image) => {
                names.push(path.display().to_string());
                images.push(image);
            }
            Err(e) => tracing::error!("{:#}", e),
        }
    }

    // 预处理可能阻塞在资源池上，放到阻塞线程执行
    let submitter = Arc::clone(&detector);
    let (images, futures) = tokio::task::spawn_blocking(move || {
        let futures = submitter.submit_many(&images);
        (images, futures)
    })
    .await?;

    for ((name, image), future) in names.into_iter().zip(&images).zip(futures) {
        let boxes = future.await;
        let report = ImageReport {
            image: name,
            width: image.width(),
            height: image.height(),
            boxes,
        };
        println!("{}", serde_json::to_string(&report)?);
    }

    let stopper = Arc::clone(&detector);
    tokio::task::spawn_blocking(move || stopper.stop()).await?;
    tracing::info!("batchdet finished");

    Ok(())
}

// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 集成测试
//!
//! 使用 ScriptedEngine 驱动完整的 预处理 -> 批处理 -> 解码 + NMS 流程。

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use batchdet::device::current_device;
use batchdet::{
    BoxList, DetectionBox, Detector, DetectorConfig, DetectorError, DetectorKind, DeviceId,
    EngineLoader, create_detector,
};

use scripted_engine::{
    MAIN_CONFIDENCE, NUM_CLASSES, ScriptedOptions, failing_loader, marker_image, scripted_loader,
};

fn detector_config(confidence_threshold: f32) -> DetectorConfig {
    DetectorConfig {
        kind: DetectorKind::V5,
        confidence_threshold,
        nms_threshold: 0.5,
        acquire_timeout_ms: 5_000,
        ..Default::default()
    }
}

fn scripted_detector(
    confidence_threshold: f32,
    options: ScriptedOptions,
) -> (Detector, Arc<Mutex<Vec<usize>>>) {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let detector = Detector::with_engine(
        &detector_config(confidence_threshold),
        scripted_loader(options, Arc::clone(&batches)),
    )
    .expect("scripted detector should start");
    (detector, batches)
}

fn main_box(boxes: &BoxList) -> Option<&DetectionBox> {
    boxes
        .iter()
        .find(|b| (b.confidence - MAIN_CONFIDENCE).abs() < 1e-4)
}

#[test]
fn test_submit_many_forms_batches_of_two_two_one() {
    let (detector, batches) = scripted_detector(0.25, ScriptedOptions::default());

    let images: Vec<_> = (0..5).map(|marker| marker_image(marker, 32, 32)).collect();
    let results: Vec<BoxList> = detector
        .submit_many(&images)
        .into_iter()
        .map(|future| future.wait())
        .collect();

    assert_eq!(results.len(), 5);
    assert_eq!(*batches.lock().unwrap(), vec![2, 2, 1]);
    for (marker, boxes) in results.iter().enumerate() {
        let main = main_box(boxes).expect("main box should be detected");
        assert_eq!(main.class_label, marker);
    }
}

#[test]
fn test_results_are_not_swapped_between_images() {
    let (detector, _) = scripted_detector(0.25, ScriptedOptions::default());

    let sizes = [(32, 32), (64, 48), (40, 80), (32, 32), (100, 100), (17, 23)];
    let futures: Vec<_> = sizes
        .iter()
        .enumerate()
        .map(|(marker, &(w, h))| detector.submit(&marker_image(marker, w, h)))
        .collect();

    for (marker, future) in futures.into_iter().enumerate() {
        let boxes = future.wait();
        let main = main_box(&boxes).expect("main box should be detected");
        assert_eq!(main.class_label, marker % NUM_CLASSES);
    }
}

#[test]
fn test_boxes_are_mapped_to_image_coordinates() {
    let (detector, _) = scripted_detector(0.25, ScriptedOptions::default());

    // 32x32 图像的 letterbox 是恒等变换
    let boxes = detector.submit(&marker_image(1, 32, 32)).wait();
    let main = main_box(&boxes).unwrap();
    assert_eq!(
        [main.left, main.top, main.right, main.bottom],
        [12.0, 12.0, 20.0, 20.0]
    );

    // 64x64 图像缩放 0.5，框映射回原图后放大一倍
    let boxes = detector.submit(&marker_image(1, 64, 64)).wait();
    let main = main_box(&boxes).unwrap();
    assert!((main.width() - 16.0).abs() < 1e-3);
    assert!((main.height() - 16.0).abs() < 1e-3);
    assert!((main.left - 24.5).abs() < 1e-3);
}

#[test]
fn test_confidence_threshold_is_respected() {
    for threshold in [0.25f32, 0.5] {
        let (detector, _) = scripted_detector(threshold, ScriptedOptions::default());
        let images: Vec<_> = (0..4).map(|marker| marker_image(marker, 48, 32)).collect();

        for boxes in detector.submit_many(&images).into_iter().map(|f| f.wait()) {
            assert!(!boxes.is_empty());
            assert!(boxes.iter().all(|b| b.confidence >= threshold));

            // 0.6 * 0.5 = 0.3 的小框只在低阈值下保留
            let expected = if threshold < 0.3 { 2 } else { 1 };
            assert_eq!(boxes.len(), expected);
        }
    }
}

#[test]
fn test_nms_removes_overlapping_duplicates() {
    let (detector, _) = scripted_detector(0.25, ScriptedOptions::default());

    let boxes = detector.submit(&marker_image(3, 32, 32)).wait();
    let same_class: Vec<_> = boxes.iter().filter(|b| b.class_label == 3).collect();
    assert_eq!(same_class.len(), 1);

    for (i, a) in boxes.iter().enumerate() {
        for b in boxes.iter().skip(i + 1) {
            if a.class_label == b.class_label {
                assert!(a.iou(b) <= 0.5);
            }
        }
    }
}

#[test]
fn test_concurrent_submitters_get_their_own_results() {
    let (detector, _) = scripted_detector(0.25, ScriptedOptions::default());
    let detector = Arc::new(detector);

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let detector = Arc::clone(&detector);
            thread::spawn(move || {
                (0..5).all(|i| {
                    let marker = (worker + i) % NUM_CLASSES;
                    let boxes = detector.submit(&marker_image(marker, 32, 32)).wait();
                    main_box(&boxes).map(|b| b.class_label) == Some(marker)
                })
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap());
    }
}

#[test]
fn test_stop_twice_and_pending_jobs_resolve_empty() {
    let options = ScriptedOptions {
        forward_delay: Duration::from_millis(300),
        ..Default::default()
    };
    let (detector, batches) = scripted_detector(0.25, options);

    let images: Vec<_> = (0..4).map(|marker| marker_image(marker, 32, 32)).collect();
    let futures = detector.submit_many(&images);

    // 等 worker 取走第一批再停止
    let deadline = Instant::now() + Duration::from_secs(5);
    while batches.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "worker never started a batch");
        thread::sleep(Duration::from_millis(5));
    }

    detector.stop();
    detector.stop();
    assert!(!detector.is_running());

    let results: Vec<BoxList> = futures.into_iter().map(|f| f.wait()).collect();
    assert!(!results[0].is_empty());
    assert!(!results[1].is_empty());
    assert!(results[2].is_empty());
    assert!(results[3].is_empty());
    assert_eq!(*batches.lock().unwrap(), vec![2]);

    // 停止后的提交立即得到空结果
    assert!(detector.submit(&marker_image(0, 32, 32)).wait().is_empty());
}

#[test]
fn test_rejected_forward_resolves_everything_empty() {
    let options = ScriptedOptions {
        reject_forward: true,
        ..Default::default()
    };
    let (detector, batches) = scripted_detector(0.25, options);

    let images: Vec<_> = (0..3).map(|marker| marker_image(marker, 32, 32)).collect();
    let results: Vec<BoxList> = detector
        .submit_many(&images)
        .into_iter()
        .map(|future| future.wait())
        .collect();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|boxes| boxes.is_empty()));

    // worker 在致命错误后退出并关闭队列
    let deadline = Instant::now() + Duration::from_secs(5);
    while detector.is_running() {
        assert!(Instant::now() < deadline, "worker kept running after fatal error");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(batches.lock().unwrap().len(), 1);

    assert!(detector.submit(&marker_image(0, 32, 32)).wait().is_empty());

    detector.stop();
    detector.stop();
    assert!(!detector.is_running());
}

#[test]
fn test_detections_are_capped_per_image() {
    let config = DetectorConfig {
        max_objects: 1,
        ..detector_config(0.25)
    };
    let batches = Arc::new(Mutex::new(Vec::new()));
    let detector =
        Detector::with_engine(&config, scripted_loader(ScriptedOptions::default(), batches))
            .expect("scripted detector should start");

    let images: Vec<_> = (0..3).map(|marker| marker_image(marker, 40, 32)).collect();
    for boxes in detector.submit_many(&images).into_iter().map(|f| f.wait()) {
        // 三个候选中只保留第一个写入的主框
        assert_eq!(boxes.len(), 1);
        assert!((boxes[0].confidence - MAIN_CONFIDENCE).abs() < 1e-4);
    }
}

#[test]
fn test_configured_device_is_selected_before_loading() {
    let config = DetectorConfig {
        device_id: DeviceId(1),
        ..detector_config(0.25)
    };

    let seen = Arc::new(Mutex::new(None));
    let recorder = Arc::clone(&seen);
    let inner = scripted_loader(ScriptedOptions::default(), Arc::new(Mutex::new(Vec::new())));
    let loader: EngineLoader = Box::new(move || {
        *recorder.lock().unwrap() = Some(current_device());
        inner()
    });

    let detector = Detector::with_engine(&config, loader).expect("scripted detector should start");
    assert_eq!(*seen.lock().unwrap(), Some(DeviceId(1)));

    let boxes = detector.submit(&marker_image(2, 32, 32)).wait();
    assert_eq!(main_box(&boxes).map(|b| b.class_label), Some(2));
}

#[test]
fn test_load_failure_fails_create() {
    let result = Detector::with_engine(&detector_config(0.25), failing_loader());
    assert!(matches!(result, Err(DetectorError::ModelLoadError(_))));

    let result = create_detector("/nonexistent/yolov5s.onnx", "v5", DeviceId(0), 0.25, 0.5);
    assert!(matches!(result, Err(DetectorError::ModelLoadError(_))));

    let result = create_detector("/nonexistent/yolov5s.onnx", "detr", DeviceId(0), 0.25, 0.5);
    assert!(matches!(result, Err(DetectorError::UnsupportedKind(_))));
}

#[test]
fn test_model_without_classes_is_rejected() {
    let options = ScriptedOptions {
        num_classes: 0,
        ..Default::default()
    };
    let batches = Arc::new(Mutex::new(Vec::new()));
    let result = Detector::with_engine(&detector_config(0.25), scripted_loader(options, batches));
    assert!(matches!(result, Err(DetectorError::ModelLoadError(_))));
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = DetectorConfig {
        nms_threshold: 2.0,
        ..detector_config(0.25)
    };
    let batches = Arc::new(Mutex::new(Vec::new()));
    let result = Detector::with_engine(&config, scripted_loader(ScriptedOptions::default(), batches));
    assert!(matches!(result, Err(DetectorError::ConfigError(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_futures_can_be_awaited() {
    let (detector, _) = scripted_detector(0.25, ScriptedOptions::default());
    assert_eq!(detector.input_size(), Some((32, 32)));

    let images: Vec<_> = (0..3).map(|marker| marker_image(marker, 32, 32)).collect();
    let futures = detector.submit_many(&images);

    for (marker, future) in futures.into_iter().enumerate() {
        let boxes = future.await;
        assert_eq!(main_box(&boxes).map(|b| b.class_label), Some(marker));
    }
}

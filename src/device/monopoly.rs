// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// 有界独占资源池
///
/// 固定数量的槽位在构造时全部创建，容量之后不再变化，`acquire` 从不新建槽位。
/// 空闲槽位的下标放在一个有界 MPMC 通道里：获取 = 带超时接收，释放 = 发送，
/// 停止 = 关闭通道并清空。槽位中的数据在首次获取时惰性构造，之后复用。
pub struct MonopolyPool<T> {
    capacity: usize,
    slots: Vec<Mutex<Option<T>>>,
    free_rx: Receiver<usize>,
    free_tx: Mutex<Option<Sender<usize>>>,
    in_use: AtomicUsize,
    running: AtomicBool,
}

impl<T: Send> MonopolyPool<T> {
    /// 创建新的资源池
    pub fn new(capacity: usize) -> Arc<Self> {
        let (free_tx, free_rx) = bounded(capacity.max(1));
        for index in 0..capacity {
            // 通道容量等于槽位数，不会阻塞
            let _ = free_tx.send(index);
        }

        info!("Creating MonopolyPool with capacity={}", capacity);

        Arc::new(Self {
            capacity,
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            free_rx,
            free_tx: Mutex::new(Some(free_tx)),
            in_use: AtomicUsize::new(0),
            running: AtomicBool::new(true),
        })
    }

    /// 获取一个槽位的独占使用权
    ///
    /// 没有空闲槽位时最多阻塞 `timeout`；超时、池已停止时返回 None。
    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> Option<PoolSlot<T>> {
        if !self.is_running() {
            return None;
        }

        let index = match self.free_rx.recv_timeout(timeout) {
            Ok(index) => index,
            Err(RecvTimeoutError::Timeout) => {
                debug!(
                    "MonopolyPool acquire timed out after {:?} (capacity={})",
                    timeout, self.capacity
                );
                return None;
            }
            Err(RecvTimeoutError::Disconnected) => return None,
        };

        if !self.is_running() {
            self.give_back(index);
            return None;
        }

        self.in_use.fetch_add(1, Ordering::AcqRel);
        let value = self.slots[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        Some(PoolSlot {
            pool: Arc::clone(self),
            index,
            value,
        })
    }

    fn give_back(&self, index: usize) {
        let sender = self
            .free_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(sender) = sender.as_ref() {
            let _ = sender.send(index);
        }
    }

    fn release_slot(&self, index: usize, value: Option<T>) {
        *self.slots[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.give_back(index);
    }

    /// 停止资源池：唤醒所有等待者，之后的获取全部失败
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let sender = self
            .free_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(sender);

        let drained = self.free_rx.try_iter().count();
        debug!("MonopolyPool stopped, {} idle slots drained", drained);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 空闲槽位数
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    /// 使用中的槽位数
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// 槽位守卫，Drop 时归还槽位
pub struct PoolSlot<T: Send> {
    pool: Arc<MonopolyPool<T>>,
    index: usize,
    value: Option<T>,
}

impl<T: Send> PoolSlot<T> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn data(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn data_mut(&mut self) -> Option<&mut T> {
        self.value.as_mut()
    }

    /// 首次使用时构造槽位数据
    pub fn get_or_insert_with(&mut self, init: impl FnOnce() -> T) -> &mut T {
        self.value.get_or_insert_with(init)
    }

    /// 显式归还槽位
    pub fn release(self) {}
}

impl<T: Send> Drop for PoolSlot<T> {
    fn drop(&mut self) {
        self.pool.release_slot(self.index, self.value.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_pool_creation() {
        let pool = MonopolyPool::<u32>::new(4);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_capacity_invariant() {
        let pool = MonopolyPool::<u32>::new(3);

        let slots: Vec<_> = (0..3)
            .map(|_| pool.acquire(Duration::from_millis(10)).unwrap())
            .collect();
        assert_eq!(pool.available() + pool.in_use(), pool.capacity());
        assert_eq!(pool.in_use(), 3);

        // 超出容量的获取在超时后失败
        let start = Instant::now();
        assert!(pool.acquire(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));

        drop(slots);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_concurrent_acquire_blocks_until_release() {
        let pool = MonopolyPool::<u32>::new(2);
        let first = pool.acquire(Duration::from_millis(10)).unwrap();
        let _second = pool.acquire(Duration::from_millis(10)).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire(Duration::from_secs(5)).map(|slot| slot.index()))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        let released = first.index();
        first.release();

        assert_eq!(waiter.join().unwrap(), Some(released));
    }

    #[test]
    fn test_acquire_from_more_threads_than_capacity() {
        const THREADS: usize = 8;
        let pool = MonopolyPool::<u32>::new(4);
        let attempted = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let attempted = Arc::clone(&attempted);
                thread::spawn(move || {
                    let first = pool.acquire(Duration::ZERO);
                    let immediate = first.is_some();

                    // 所有线程都尝试过一次之后才归还
                    attempted.wait();
                    drop(first);

                    let acquired = immediate || pool.acquire(Duration::from_secs(5)).is_some();
                    (immediate, acquired)
                })
            })
            .collect();

        let results: Vec<(bool, bool)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(immediate, _)| *immediate).count(), 4);
        assert!(results.iter().all(|(_, acquired)| *acquired));
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_lazy_value_is_reused() {
        let pool = MonopolyPool::<Vec<u8>>::new(1);

        let mut slot = pool.acquire(Duration::from_millis(10)).unwrap();
        assert!(slot.data().is_none());
        slot.get_or_insert_with(|| vec![1, 2, 3]).push(4);
        drop(slot);

        let mut slot = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(slot.data(), Some(&vec![1, 2, 3, 4]));
        assert_eq!(slot.get_or_insert_with(Vec::new).len(), 4);
    }

    #[test]
    fn test_stop_wakes_waiters() {
        let pool = MonopolyPool::<u32>::new(1);
        let held = pool.acquire(Duration::from_millis(10)).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire(Duration::from_secs(30)).is_some())
        };

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        pool.stop();

        assert!(!waiter.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));

        // 停止后归还不会让槽位重新可用
        drop(held);
        assert!(pool.acquire(Duration::from_millis(10)).is_none());
        assert_eq!(pool.in_use(), 0);
    }
}

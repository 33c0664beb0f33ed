//! Tests for the socket buffer pool

use std::thread;

use team_kernel::infra::BufferPool;

#[test]
fn test_larger_requests_use_larger_buckets() {
    let pool = BufferPool::new(1024, 4);
    assert!(pool.bucket_for(4096) > pool.bucket_for(1024));
    assert!(pool.acquire(5000).capacity() >= 5000);
}

#[test]
fn test_pool_is_shared_across_threads() {
    let pool = BufferPool::new(512, 8);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let mut buf = pool.acquire(512);
                    buf.extend_from_slice(&[7; 64]);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.hits + stats.misses, 400);
    assert!(stats.retained <= 8);
}

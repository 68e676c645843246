use scull::{
    AccessDevice, AccessMode, AccessPolicy, Caller, Credentials, DeviceError, Geometry, IdGen,
    OpenFlags, SessionKey, StoreFile, WaitQueueArc,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn device(policy: AccessPolicy) -> (Arc<AccessDevice>, IdGen) {
    let (device, idgen, _) = device_with_queue(policy);
    (device, idgen)
}

fn device_with_queue(policy: AccessPolicy) -> (Arc<AccessDevice>, IdGen, WaitQueueArc) {
    let idgen = IdGen::new();
    let queue = WaitQueueArc::new();
    let device = AccessDevice::new(
        "dev",
        policy,
        Geometry { quantum: 8, qset: 4 },
        queue.clone(),
        &idgen,
    );
    (Arc::new(device), idgen, queue)
}

async fn open(
    device: &Arc<AccessDevice>,
    idgen: &IdGen,
    caller: &Caller,
    mode: AccessMode,
) -> Result<StoreFile, DeviceError> {
    StoreFile::open(Arc::clone(device), idgen.next_handle(), caller.clone(), OpenFlags::new(mode)).await
}

fn user(uid: u32) -> Caller {
    Caller::new(Credentials::user(uid))
}

// ============================================================================
// Exclusive
// ============================================================================

#[tokio::test]
async fn test_exclusive_second_open_is_busy() {
    let (dev, idgen) = device(AccessPolicy::Exclusive);

    let first = open(&dev, &idgen, &user(1), AccessMode::ReadWrite).await.unwrap();
    let second = open(&dev, &idgen, &user(1), AccessMode::ReadOnly).await;
    assert_eq!(second.unwrap_err(), DeviceError::Busy);

    // Anyone may take it once released
    first.release();
    assert_eq!(dev.opener_count(), 0);
    let third = open(&dev, &idgen, &user(2), AccessMode::ReadOnly).await.unwrap();
    assert_eq!(dev.opener_count(), 1);
    drop(third);
    assert_eq!(dev.opener_count(), 0);
}

#[tokio::test]
async fn test_exclusive_concurrent_opens_admit_exactly_one() {
    let (dev, idgen) = device(AccessPolicy::Exclusive);
    let caller = user(1);

    let attempts = (0..8).map(|_| open(&dev, &idgen, &caller, AccessMode::ReadOnly));
    let results = futures::future::join_all(attempts).await;

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(DeviceError::Busy)))
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(busy, 7);
}

// ============================================================================
// ConcurrentByOwner
// ============================================================================

#[tokio::test]
async fn test_owner_admits_same_uid_and_euid() {
    let (dev, idgen) = device(AccessPolicy::ConcurrentByOwner);

    let a = open(&dev, &idgen, &user(100), AccessMode::ReadOnly).await.unwrap();
    let b = open(&dev, &idgen, &user(100), AccessMode::ReadOnly).await.unwrap();
    let c = open(
        &dev,
        &idgen,
        &Caller::new(Credentials::user(7).with_euid(100)),
        AccessMode::ReadOnly,
    )
    .await
    .unwrap();

    assert_eq!(dev.owner(), Some(100));
    assert_eq!(dev.opener_count(), 3);

    let stranger = open(&dev, &idgen, &user(200), AccessMode::ReadOnly).await;
    assert_eq!(stranger.unwrap_err(), DeviceError::Busy);
    assert_eq!(dev.opener_count(), 3);

    drop((a, b, c));
    assert_eq!(dev.opener_count(), 0);
    assert_eq!(dev.owner(), None);
}

#[tokio::test]
async fn test_privileged_caller_joins_foreign_owner() {
    let (dev, idgen) = device(AccessPolicy::ConcurrentByOwner);

    let _owner = open(&dev, &idgen, &user(100), AccessMode::ReadOnly).await.unwrap();
    let admin = Caller::new(Credentials::user(0).privileged());
    let _joined = open(&dev, &idgen, &admin, AccessMode::ReadOnly).await.unwrap();

    // Ownership does not move to the privileged joiner
    assert_eq!(dev.owner(), Some(100));
    assert_eq!(dev.opener_count(), 2);
}

#[tokio::test]
async fn test_ownership_resets_after_last_close() {
    let (dev, idgen) = device(AccessPolicy::ConcurrentByOwner);

    let a = open(&dev, &idgen, &user(100), AccessMode::ReadOnly).await.unwrap();
    a.release();

    let _b = open(&dev, &idgen, &user(200), AccessMode::ReadOnly).await.unwrap();
    assert_eq!(dev.owner(), Some(200));
}

// ============================================================================
// BlockingByOwner
// ============================================================================

#[tokio::test]
async fn test_blocking_owner_waits_for_release() {
    let (dev, idgen) = device(AccessPolicy::BlockingByOwner);
    let idgen = Arc::new(idgen);

    let x = open(&dev, &idgen, &user(100), AccessMode::ReadOnly).await.unwrap();

    let waiter = {
        let dev = Arc::clone(&dev);
        let idgen = Arc::clone(&idgen);
        tokio::spawn(async move {
            let file = open(&dev, &idgen, &user(200), AccessMode::ReadOnly).await?;
            Ok::<_, DeviceError>(file)
        })
    };

    // Still suspended while X holds the device
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    assert_eq!(dev.owner(), Some(100));

    x.release();

    let y = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should be woken by the release")
        .unwrap()
        .unwrap();
    assert_eq!(dev.owner(), Some(200));
    assert_eq!(dev.opener_count(), 1);
    drop(y);
}

#[tokio::test]
async fn test_blocking_owner_nonblocking_conflict_would_block() {
    let (dev, idgen) = device(AccessPolicy::BlockingByOwner);
    let _x = open(&dev, &idgen, &user(100), AccessMode::ReadOnly).await.unwrap();

    let result = StoreFile::open(
        Arc::clone(&dev),
        idgen.next_handle(),
        user(200),
        OpenFlags::new(AccessMode::ReadOnly).nonblocking(),
    )
    .await;
    assert_eq!(result.unwrap_err(), DeviceError::WouldBlock);
    assert_eq!(dev.opener_count(), 1);
}

#[tokio::test]
async fn test_blocking_owner_wait_is_interruptible() {
    let (dev, idgen) = device(AccessPolicy::BlockingByOwner);
    let idgen = Arc::new(idgen);
    let _x = open(&dev, &idgen, &user(100), AccessMode::ReadOnly).await.unwrap();

    let y = user(200);
    let signal = y.signal.clone();
    let waiter = {
        let dev = Arc::clone(&dev);
        let idgen = Arc::clone(&idgen);
        tokio::spawn(async move { open(&dev, &idgen, &y, AccessMode::ReadOnly).await.map(drop) })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    signal.raise();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("interrupt should end the wait")
        .unwrap();
    assert_eq!(result, Err(DeviceError::Interrupted));
    // The interrupted open left no trace
    assert_eq!(dev.opener_count(), 1);
    assert_eq!(dev.owner(), Some(100));
}

#[tokio::test]
async fn test_interrupted_opens_leave_no_sleepers() {
    let (dev, idgen, queue) = device_with_queue(AccessPolicy::BlockingByOwner);
    let _x = open(&dev, &idgen, &user(100), AccessMode::ReadOnly).await.unwrap();

    for _ in 0..50 {
        let y = user(200);
        let signal = y.signal.clone();
        let (result, ()) = tokio::join!(open(&dev, &idgen, &y, AccessMode::ReadOnly), async {
            tokio::task::yield_now().await;
            signal.raise();
        });
        assert_eq!(result.unwrap_err(), DeviceError::Interrupted);
    }

    assert_eq!(queue.sleeper_total(), 0);
    assert_eq!(dev.opener_count(), 1);
}

/// Many identities hammer one device; at no point may two of them be inside.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocking_owner_admits_one_identity_at_a_time() {
    let (dev, idgen, queue) = device_with_queue(AccessPolicy::BlockingByOwner);
    let idgen = Arc::new(idgen);
    // (uid inside, handles it holds)
    let inside = Arc::new(parking_lot::Mutex::new((None::<u32>, 0usize)));
    let violations = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for uid in 1..=6u32 {
        for _ in 0..2 {
            let dev = Arc::clone(&dev);
            let idgen = Arc::clone(&idgen);
            let inside = Arc::clone(&inside);
            let violations = Arc::clone(&violations);
            tasks.push(tokio::spawn(async move {
                for _ in 0..40 {
                    let file = open(&dev, &idgen, &user(uid), AccessMode::ReadOnly).await.unwrap();
                    {
                        let mut inside = inside.lock();
                        if inside.0.is_some_and(|other| other != uid) {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        inside.0 = Some(uid);
                        inside.1 += 1;
                    }
                    tokio::task::yield_now().await;
                    {
                        let mut inside = inside.lock();
                        inside.1 -= 1;
                        if inside.1 == 0 {
                            inside.0 = None;
                        }
                    }
                    file.release();
                }
            }));
        }
    }

    tokio::time::timeout(Duration::from_secs(20), futures::future::join_all(tasks))
        .await
        .expect("contended opens should all get through")
        .into_iter()
        .for_each(|result| result.unwrap());

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(dev.opener_count(), 0);
    assert_eq!(dev.owner(), None);
    assert_eq!(queue.sleeper_total(), 0);
}

#[tokio::test]
async fn test_blocking_owner_same_uid_joins_immediately() {
    let (dev, idgen) = device(AccessPolicy::BlockingByOwner);
    let _a = open(&dev, &idgen, &user(100), AccessMode::ReadOnly).await.unwrap();

    let b = tokio::time::timeout(
        Duration::from_millis(200),
        open(&dev, &idgen, &user(100), AccessMode::ReadOnly),
    )
    .await
    .expect("same owner must not wait");
    assert!(b.is_ok());
    assert_eq!(dev.opener_count(), 2);
}

// ============================================================================
// KeyedPerClient
// ============================================================================

fn session_caller(uid: u32, key: u64) -> Caller {
    Caller::new(Credentials::user(uid).with_session(SessionKey(key)))
}

#[tokio::test]
async fn test_keyed_sessions_are_isolated() {
    let (dev, idgen) = device(AccessPolicy::KeyedPerClient);

    let mut k1 = open(&dev, &idgen, &session_caller(1, 1), AccessMode::ReadWrite).await.unwrap();
    let mut k2 = open(&dev, &idgen, &session_caller(1, 2), AccessMode::ReadWrite).await.unwrap();

    k1.write_all(b"one").unwrap();
    k2.write_all(b"two!").unwrap();

    let mut again = open(&dev, &idgen, &session_caller(2, 1), AccessMode::ReadOnly).await.unwrap();
    assert_eq!(again.read_to_end().unwrap(), b"one");

    let keyed = dev.keyed().unwrap();
    assert_eq!(keyed.keys(), vec![SessionKey(1), SessionKey(2)]);
    assert_eq!(keyed.get(SessionKey(2)).unwrap().size(), 4);
}

#[tokio::test]
async fn test_keyed_concurrent_first_open_shares_one_store() {
    let (dev, idgen) = device(AccessPolicy::KeyedPerClient);
    let caller = session_caller(1, 42);

    let attempts = (0..6).map(|_| open(&dev, &idgen, &caller, AccessMode::ReadOnly));
    let files: Vec<StoreFile> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(dev.keyed().unwrap().len(), 1);
    let first = files[0].device();
    assert!(files.iter().all(|f| Arc::ptr_eq(f.device(), first)));
}

#[tokio::test]
async fn test_keyed_without_session_is_invalid() {
    let (dev, idgen) = device(AccessPolicy::KeyedPerClient);
    let result = open(&dev, &idgen, &user(1), AccessMode::ReadOnly).await;
    assert_eq!(result.unwrap_err(), DeviceError::InvalidArgument);
    assert!(dev.keyed().unwrap().is_empty());
}

// ============================================================================
// Write-only truncation
// ============================================================================

#[tokio::test]
async fn test_write_only_open_truncates() {
    for policy in [
        AccessPolicy::Unrestricted,
        AccessPolicy::Exclusive,
        AccessPolicy::ConcurrentByOwner,
        AccessPolicy::BlockingByOwner,
    ] {
        let (dev, idgen) = device(policy);
        let caller = user(1);

        let mut rw = open(&dev, &idgen, &caller, AccessMode::ReadWrite).await.unwrap();
        rw.write_all(b"some bytes spanning quanta").unwrap();
        rw.release();
        assert_eq!(dev.device().unwrap().size(), 26, "{policy:?}");

        // Read-write does not truncate
        let rw = open(&dev, &idgen, &caller, AccessMode::ReadWrite).await.unwrap();
        assert_eq!(dev.device().unwrap().size(), 26, "{policy:?}");
        rw.release();

        let wo = open(&dev, &idgen, &caller, AccessMode::WriteOnly).await.unwrap();
        assert_eq!(dev.device().unwrap().size(), 0, "{policy:?}");
        assert_eq!(dev.device().unwrap().allocated_quanta(), 0, "{policy:?}");
        wo.release();
    }
}

#[tokio::test]
async fn test_keyed_write_only_truncates_own_store_only() {
    let (dev, idgen) = device(AccessPolicy::KeyedPerClient);

    let mut k1 = open(&dev, &idgen, &session_caller(1, 1), AccessMode::ReadWrite).await.unwrap();
    let mut k2 = open(&dev, &idgen, &session_caller(1, 2), AccessMode::ReadWrite).await.unwrap();
    k1.write_all(b"keep").unwrap();
    k2.write_all(b"drop").unwrap();

    let _wo = open(&dev, &idgen, &session_caller(1, 2), AccessMode::WriteOnly).await.unwrap();

    let keyed = dev.keyed().unwrap();
    assert_eq!(keyed.get(SessionKey(1)).unwrap().size(), 4);
    assert_eq!(keyed.get(SessionKey(2)).unwrap().size(), 0);
}

// ============================================================================
// Handle mode checks
// ============================================================================

#[tokio::test]
async fn test_mode_mismatch_is_bad_handle() {
    let (dev, idgen) = device(AccessPolicy::Unrestricted);
    let caller = user(1);

    let mut ro = open(&dev, &idgen, &caller, AccessMode::ReadOnly).await.unwrap();
    assert_eq!(ro.write(b"x").unwrap_err(), DeviceError::BadHandle);

    let mut wo = open(&dev, &idgen, &caller, AccessMode::WriteOnly).await.unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(wo.read(&mut buf).unwrap_err(), DeviceError::BadHandle);
}

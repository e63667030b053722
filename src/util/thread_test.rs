use super::*;

#[test]
fn test_thread_gen_server() {
    let thread = Thread::<u64, u64, Result<u64>>::new("test-thread", |rx: Rx<u64, u64>| {
        move || {
            let mut acc = 0_u64;
            for (msg, resp) in rx.iter() {
                acc += msg;
                if let Some(tx) = resp {
                    tx.send(acc).unwrap();
                }
            }
            Ok(acc)
        }
    });
    assert_eq!(thread.to_name(), "test-thread".to_string());

    let tx = thread.to_tx();
    tx.post(10).unwrap();
    tx.post(20).unwrap();
    assert_eq!(tx.request(5).unwrap(), 35);

    std::mem::drop(tx);
    assert_eq!(thread.close_wait().unwrap().unwrap(), 35);
}

#[test]
fn test_pool() {
    let mut pool = Pool::<u64, u64, Result<u64>>::new("test-pool");
    pool.set_pool_size(4);
    pool.spawn(|rx: Rx<u64, u64>| {
        move || {
            let mut acc = 0_u64;
            for (msg, resp) in rx.iter() {
                acc += msg;
                if let Some(tx) = resp {
                    tx.send(msg).unwrap();
                }
            }
            Ok(acc)
        }
    });
    assert_eq!(pool.to_name(), "test-pool".to_string());
    assert_eq!(pool.to_txs().len(), 4);

    for i in 0..100 {
        pool.post(i).unwrap();
    }
    assert_eq!(pool.request(42).unwrap(), 42);

    let mut total = 0;
    for result in pool.close_wait().unwrap() {
        total += result.unwrap();
    }
    assert_eq!(total, (0..100).sum::<u64>() + 42);
}

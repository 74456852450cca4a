#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use warren_amqp::{transport::memory::MemoryBroker, Client, Config, HandlerError};

pub const ADDRESS: &str = "memory://warren";

pub fn open(broker: &MemoryBroker, queue: &str, keys: &[&str]) -> Client {
    let config = Config::new(queue, ADDRESS, keys.iter().copied());
    Client::open(config, broker.clone()).expect("valid config")
}

/// Bodies seen by a consumer, in delivery order, with their redelivered flag.
#[derive(Clone, Default)]
pub struct Seen(Arc<Mutex<Vec<(String, bool)>>>);

impl Seen {
    pub fn bodies(&self) -> Vec<String> {
        self.0.lock().iter().map(|(b, _)| b.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn entries(&self) -> Vec<(String, bool)> {
        self.0.lock().clone()
    }
}

/// Spawns `consume_func` recording every delivery. `fail` decides, from the
/// attempt number (1-based) and the body, whether the handler fails.
pub fn spawn_consumer<F>(client: &Client, seen: Seen, fail: F) -> JoinHandle<()>
where
    F: Fn(usize, &str) -> bool + Send + Sync + 'static,
{
    let client = client.clone();
    let fail = Arc::new(fail);
    tokio::spawn(async move {
        client
            .consume_func(move |delivery| {
                let seen = seen.clone();
                let fail = fail.clone();
                async move {
                    let body = String::from_utf8_lossy(&delivery.body).to_string();
                    let attempt = {
                        let mut entries = seen.0.lock();
                        entries.push((body.clone(), delivery.redelivered));
                        entries.len()
                    };
                    // Yield so a failing handler never monopolises the runtime.
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    if fail(attempt, &body) {
                        Err::<(), HandlerError>(format!("cannot process {body}").into())
                    } else {
                        Ok(())
                    }
                }
            })
            .await
    })
}

/*
Copyright 2024 The Kuasar Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::StreamExt;
use log::{error, info};
use nix::libc;
use signal_hook_tokio::Signals;
use tokio::sync::Notify;

/// One-shot shutdown signal shared by every background loop.
#[derive(Debug, Default)]
pub struct ExitSignal {
    notifier: Notify,
    exited: AtomicBool,
}

impl ExitSignal {
    pub fn signal(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.notifier.notify_waiters();
    }

    pub fn is_signaled(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notifier.notified();
            if self.exited.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

pub async fn handle_signals(exit: Arc<ExitSignal>) {
    let mut signals = match Signals::new([libc::SIGTERM, libc::SIGINT]) {
        Ok(s) => s.fuse(),
        Err(e) => {
            error!("failed to register signal handler: {}", e);
            return;
        }
    };

    if let Some(sig) = signals.next().await {
        info!("received signal {}, shutting down", sig);
        exit.signal();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::ExitSignal;

    #[tokio::test]
    async fn test_wait_after_signal() {
        let exit = ExitSignal::default();
        exit.signal();
        assert!(exit.is_signaled());
        tokio::time::timeout(Duration::from_secs(1), exit.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_wakes_waiters() {
        let exit = Arc::new(ExitSignal::default());
        let waiter = {
            let exit = exit.clone();
            tokio::spawn(async move { exit.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        exit.signal();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}

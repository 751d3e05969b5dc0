//! Managed thread for the IO runtime.

use std::future::Future;

use crate::Error;

/// Dedicated thread running a single-threaded Tokio runtime. Everything spawned on it runs on
/// that one thread, so callbacks of a single pipeline never run concurrently with each other.
pub(crate) struct Runtime {
    handle: tokio::runtime::Handle,
    join_handle: Option<std::thread::JoinHandle<()>>,
    quit_tx: tokio::sync::mpsc::UnboundedSender<()>,
}

impl Runtime {
    pub fn new() -> Result<Self, Error> {
        let (quit_tx, mut quit_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();

        let join_handle = std::thread::Builder::new()
            .name(concat!(env!("CARGO_PKG_NAME"), "-io").to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(error) => {
                        let _ = handle_tx.send(Err(error));
                        return;
                    }
                };

                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(quit_rx.recv());
            })
            .map_err(Error::Runtime)?;

        let handle = handle_rx
            .recv()
            .map_err(|_| Error::Runtime(std::io::Error::other("IO thread exited early")))?
            .map_err(Error::Runtime)?;

        Ok(Self {
            handle,
            join_handle: Some(join_handle),
            quit_tx,
        })
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Tokio thread might be dead, nothing to do in this case.
        let _ = self.quit_tx.send(());

        if let Some(join_handle) = self.join_handle.take() {
            log::debug!("Waiting for the Tokio thread to exit.");
            // Again, Tokio thread might be already dead, nothing to do in this case.
            let _ = join_handle.join();
        }

        log::debug!("Tokio thread is down.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_futures_run_on_the_io_thread() {
        let runtime = Runtime::new().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        runtime.spawn(async move {
            let name = std::thread::current().name().map(str::to_owned);
            tx.send(name).unwrap();
        });

        assert_eq!(Some("maptiles-io".to_owned()), rx.recv().unwrap());
    }

    #[test]
    fn pending_futures_are_dropped_with_the_runtime() {
        let runtime = Runtime::new().unwrap();
        let (tx, rx) = std::sync::mpsc::channel::<()>();

        runtime.spawn(async move {
            std::future::pending::<()>().await;
            drop(tx);
        });

        drop(runtime);
        assert!(rx.recv().is_err());
    }
}

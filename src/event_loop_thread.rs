//! `EventLoopThread`: spawns a thread, builds an `EventLoop` on it, and
//! hands back a `Send`-safe handle to that loop once it's ready.
//!
//! No original `EventLoopThread.cc`/`.h` shipped in the retrieved reference
//! sources (the original's `EventLoopThreadPool` was header-only in what
//! was retrieved); this follows the well-known muduo shape: spawn, build
//! the loop on the new thread, run `thread_init_callback`, publish the
//! loop's handle back to the spawning thread via a one-shot channel, then
//! block in `EventLoop::run()` until told to quit.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::{EventLoop, EventLoopHandle};

pub struct EventLoopThread {
    handle: EventLoopHandle,
    join: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(thread_init_cb: Option<ThreadInitCallback>, name: String) -> EventLoopThread {
        let (tx, rx) = mpsc::sync_channel::<EventLoopHandle>(0);

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(l) => l,
                    Err(e) => {
                        log::error!("event loop thread [{name}]: failed to create loop: {e}");
                        return;
                    }
                };

                if let Some(cb) = &thread_init_cb {
                    cb(&event_loop);
                }

                if tx.send(event_loop.handle()).is_err() {
                    // Spawner already gave up waiting; run anyway so the
                    // thread doesn't leak, nothing will ever reach it.
                }

                event_loop.run();
            })
            .expect("failed to spawn event loop thread");

        let handle = rx.recv().expect("event loop thread died before starting");

        EventLoopThread { handle, join: Some(join) }
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

//! Owns the single currently-active demodulator thread (spec.md §5:
//! "exactly one active demodulator runs at a time"; §9's cancellation
//! token guidance). Swapping modes stops the old thread and starts a new
//! one in its place; `snapshot()` lets the status publisher read the
//! active demodulator's fields without holding its lock for the
//! duration of a block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use dsp::demod::{AudioSink, DemodSnapshot, Demodulator};

pub struct DemodRuntime {
    demod: Arc<Mutex<Box<dyn Demodulator>>>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DemodRuntime {
    pub fn new(demod: Box<dyn Demodulator>, sink: Box<dyn AudioSink>) -> Self {
        let mut runtime = Self {
            demod: Arc::new(Mutex::new(demod)),
            cancel: Arc::new(AtomicBool::new(false)),
            handle: None,
        };
        runtime.spawn(sink);
        runtime
    }

    fn spawn(&mut self, mut sink: Box<dyn AudioSink>) {
        self.cancel = Arc::new(AtomicBool::new(false));
        let cancel = self.cancel.clone();
        let demod = self.demod.clone();
        self.handle = Some(
            std::thread::Builder::new()
                .name("radiod-demod".into())
                .spawn(move || {
                    while !cancel.load(Ordering::Relaxed) {
                        demod.lock().run_once(sink.as_mut());
                    }
                })
                .expect("spawn demodulator thread"),
        );
    }

    pub fn snapshot(&self) -> DemodSnapshot {
        self.demod.lock().snapshot()
    }

    /// Stops the current demodulator thread and starts a new one in its
    /// place, so the switch is never observed running both mode's
    /// demodulators concurrently on the filter master they share.
    pub fn replace(&mut self, demod: Box<dyn Demodulator>, sink: Box<dyn AudioSink>) {
        self.stop();
        self.demod = Arc::new(Mutex::new(demod));
        self.spawn(sink);
    }

    fn stop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DemodRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

pub mod test_helpers {
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use flume::{Receiver, Sender};
    use image::Rgb;
    use tempfile::TempDir;

    use crate::render::{
        CodecError, Document, MemoryPageCache, PageCodec, PageHandle, PageImage, RenderScheduler,
        SchedulerConfig,
    };

    /// Bytes that make [`FakeCodec::open`] fail
    pub const UNREADABLE: &[u8] = b"unreadable";

    struct Gate {
        reached: Sender<()>,
        release: Receiver<()>,
    }

    impl Gate {
        fn pair() -> (Self, Receiver<()>, Sender<()>) {
            let (reached_tx, reached_rx) = flume::bounded(1);
            let (release_tx, release_rx) = flume::bounded(1);
            let gate = Self {
                reached: reached_tx,
                release: release_rx,
            };
            (gate, reached_rx, release_tx)
        }

        fn pass(self) {
            let _ = self.reached.send(());
            let _ = self.release.recv();
        }
    }

    /// Shared, scriptable state behind a [`FakeCodec`] and its handles.
    #[derive(Default)]
    pub struct Script {
        pages: usize,
        failing: Mutex<HashSet<usize>>,
        oom_at: Mutex<Option<usize>>,
        gate: Mutex<Option<(usize, Gate)>>,
        open_gate: Mutex<Option<Gate>>,
        rendered: Mutex<Vec<usize>>,
        pub opens: AtomicUsize,
        pub renders: AtomicUsize,
        pub closes: AtomicUsize,
    }

    impl Script {
        pub fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        pub fn renders(&self) -> usize {
            self.renders.load(Ordering::SeqCst)
        }

        pub fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        /// Handles opened and not yet closed
        pub fn open_handles(&self) -> usize {
            self.opens().saturating_sub(self.closes())
        }

        /// Page indices passed to the rasterizer, in call order
        pub fn rendered_indices(&self) -> Vec<usize> {
            self.rendered.lock().unwrap().clone()
        }

        /// Every render of `page` fails
        pub fn fail_page(&self, page: usize) {
            self.failing.lock().unwrap().insert(page);
        }

        /// The next render of `page` reports out of memory
        pub fn oom_once_at(&self, page: usize) {
            *self.oom_at.lock().unwrap() = Some(page);
        }

        /// The next render of `page` blocks until the returned sender fires.
        /// The receiver fires when the render reaches the page.
        pub fn gate_at(&self, page: usize) -> (Receiver<()>, Sender<()>) {
            let (gate, reached, release) = Gate::pair();
            *self.gate.lock().unwrap() = Some((page, gate));
            (reached, release)
        }

        /// Like [`gate_at`](Self::gate_at), for the next `open`.
        pub fn gate_open(&self) -> (Receiver<()>, Sender<()>) {
            let (gate, reached, release) = Gate::pair();
            *self.open_gate.lock().unwrap() = Some(gate);
            (reached, release)
        }
    }

    /// In-memory codec producing solid-colour pages, one shade per index.
    #[derive(Clone)]
    pub struct FakeCodec {
        pub script: Arc<Script>,
    }

    impl FakeCodec {
        pub fn with_pages(pages: usize) -> Self {
            Self {
                script: Arc::new(Script {
                    pages,
                    ..Script::default()
                }),
            }
        }
    }

    impl PageCodec for FakeCodec {
        type Handle = FakeHandle;

        fn open(&self, staged: &Path) -> Result<FakeHandle, CodecError> {
            let bytes = std::fs::read(staged).map_err(|e| CodecError::Open(e.to_string()))?;
            let gate = self.script.open_gate.lock().unwrap().take();
            if let Some(gate) = gate {
                gate.pass();
            }
            if bytes == UNREADABLE {
                return Err(CodecError::Open("not a document".into()));
            }
            self.script.opens.fetch_add(1, Ordering::SeqCst);
            Ok(FakeHandle {
                script: Arc::clone(&self.script),
                closed: false,
            })
        }
    }

    pub struct FakeHandle {
        script: Arc<Script>,
        closed: bool,
    }

    impl PageHandle for FakeHandle {
        fn page_count(&self) -> usize {
            self.script.pages
        }

        fn render_page(&mut self, index: usize, target_width: u32) -> Result<PageImage, CodecError> {
            assert!(!self.closed, "render on a closed handle");
            self.script.renders.fetch_add(1, Ordering::SeqCst);
            self.script.rendered.lock().unwrap().push(index);

            let gate = {
                let mut gate = self.script.gate.lock().unwrap();
                if gate.as_ref().is_some_and(|(page, _)| *page == index) {
                    gate.take()
                } else {
                    None
                }
            };
            if let Some((_, gate)) = gate {
                gate.pass();
            }

            {
                let mut oom = self.script.oom_at.lock().unwrap();
                if *oom == Some(index) {
                    *oom = None;
                    return Err(CodecError::OutOfMemory { page: index });
                }
            }
            if self.script.failing.lock().unwrap().contains(&index) {
                return Err(CodecError::render(index, "damaged content stream"));
            }

            let height = target_width + target_width / 2;
            Ok(PageImage::from_pixel(
                target_width,
                height,
                Rgb([(index % 256) as u8, 0x40, 0x80]),
            ))
        }

        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.script.closes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl Drop for FakeHandle {
        fn drop(&mut self) {
            self.close();
        }
    }

    /// A scheduler over a [`FakeCodec`] rooted in a temporary directory.
    pub struct Harness {
        pub scheduler: Arc<RenderScheduler<FakeCodec>>,
        pub script: Arc<Script>,
        pub dir: TempDir,
    }

    impl Harness {
        pub fn new(pages: usize, initial_batch: usize, batch_size: usize) -> Self {
            Self::with_budget(pages, initial_batch, batch_size, 64 << 20)
        }

        pub fn with_budget(
            pages: usize,
            initial_batch: usize,
            batch_size: usize,
            memory_budget: usize,
        ) -> Self {
            let dir = TempDir::new().expect("temp dir");
            let codec = FakeCodec::with_pages(pages);
            let script = Arc::clone(&codec.script);
            let config = SchedulerConfig {
                initial_batch,
                batch_size,
                target_width: 16,
            };
            let memory = Arc::new(MemoryPageCache::new(memory_budget));
            let scheduler = RenderScheduler::new(codec, dir.path(), memory, config)
                .expect("scheduler");
            Self {
                scheduler: Arc::new(scheduler),
                script,
                dir,
            }
        }
    }

    pub fn document(name: &str) -> Document {
        Document::from_bytes(name, format!("%PDF-1.7 {name}").into_bytes())
    }
}

use std::cell::RefCell;
use std::io::{self, Write as _};
use std::rc::Rc;

/// Sink for `print` output and relayed foreign stdout.
///
/// Implement this to capture or redirect script output; the default
/// `StdPrint` writes to the process's stdout.
pub trait PrintWriter {
    fn write(&mut self, text: &str) -> io::Result<()>;
}

/// Default writer: straight to stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn write(&mut self, text: &str) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(text.as_bytes())?;
        out.flush()
    }
}

/// Writer that collects output into a shared buffer; used by tests.
#[derive(Debug, Default)]
pub struct CollectPrint {
    buffer: Rc<RefCell<String>>,
}

impl CollectPrint {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle to the buffer that stays valid after the writer is handed
    /// to an interpreter.
    pub fn handle(&self) -> Rc<RefCell<String>> {
        Rc::clone(&self.buffer)
    }
}

impl PrintWriter for CollectPrint {
    fn write(&mut self, text: &str) -> io::Result<()> {
        self.buffer.borrow_mut().push_str(text);
        Ok(())
    }
}

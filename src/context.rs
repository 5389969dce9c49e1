//! Kernel and process allocator contexts.
//!
//! Every allocator context owns a heap and a collector. The [`MemoryManager`]
//! keeps the kernel context for the whole run and at most one process context;
//! [`ExecutionContext`] selects which one an operation lands in.

use std::{fmt, sync::Arc};

use crate::{
    gc::{AllocError, GcState},
    heap::Heap,
    mmap::PageProvider,
    type_table::TypeTable,
    Config,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExecutionContext {
    Kernel,
    Process,
}

/// One heap plus the collector that manages it.
pub struct AllocatorContext {
    pub(crate) heap: Heap,
    pub(crate) gc: GcState,
    pub(crate) types: Arc<TypeTable>,
}

impl AllocatorContext {
    /// An empty context with a disabled collector. Call [`initialize`](Self::initialize) before use.
    pub fn new(config: Config, provider: Arc<dyn PageProvider>, types: Arc<TypeTable>) -> Self {
        Self {
            heap: Heap::new(config, provider),
            gc: GcState::new(),
            types,
        }
    }

    /// Grow the heap by its first region and enable the collector.
    pub fn initialize(&self) -> Result<(), AllocError> {
        if self.heap.region_count() == 0 && !self.heap.expand_heap() {
            return Err(AllocError::OutOfMemory(self.heap.config().initial_expansion));
        }
        self.gc.enable();
        Ok(())
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn gc_state(&self) -> &GcState {
        &self.gc
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    pub fn shared_types(&self) -> Arc<TypeTable> {
        self.types.clone()
    }
}

impl fmt::Debug for AllocatorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorContext")
            .field("heap", &self.heap)
            .field("gc_enabled", &self.gc.is_enabled())
            .field("pending_cleanup", &self.gc.pending_cleanup())
            .finish()
    }
}

pub struct MemoryManager {
    config: Config,
    provider: Arc<dyn PageProvider>,
    types: Arc<TypeTable>,
    kernel: AllocatorContext,
    process: Option<AllocatorContext>,
}

impl MemoryManager {
    /// Set up the kernel context. Its heap gets its first region immediately.
    pub fn new(config: Config, provider: Arc<dyn PageProvider>) -> Result<Self, AllocError> {
        let types = Arc::new(TypeTable::new());
        let kernel = AllocatorContext::new(config.clone(), provider.clone(), types.clone());
        kernel.initialize()?;
        logln_if!(config.verbose, "kernel allocator context ready");
        Ok(Self {
            config,
            provider,
            types,
            kernel,
            process: None,
        })
    }

    /// Build a fresh process context and make it current.
    ///
    /// Returns the process context that was current before, if any. Its
    /// objects stay valid for as long as the caller keeps it.
    pub fn enter_new_execution_context(&mut self) -> Result<Option<AllocatorContext>, AllocError> {
        let context =
            AllocatorContext::new(self.config.clone(), self.provider.clone(), self.types.clone());
        context.initialize()?;
        logln_if!(self.config.verbose, "entered new process allocator context");
        Ok(self.process.replace(context))
    }

    /// Make `context` the current process context again, returning the one it displaces.
    pub fn restore_process_context(
        &mut self,
        context: AllocatorContext,
    ) -> Option<AllocatorContext> {
        self.process.replace(context)
    }

    /// Drop back to kernel-only operation, handing the process context to the caller.
    pub fn leave_process_context(&mut self) -> Option<AllocatorContext> {
        self.process.take()
    }

    pub fn has_process_context(&self) -> bool {
        self.process.is_some()
    }

    pub fn kernel(&self) -> &AllocatorContext {
        &self.kernel
    }

    pub fn process(&self) -> Option<&AllocatorContext> {
        self.process.as_ref()
    }

    /// The context for `which`. A process request without a current process
    /// context lands in the kernel context.
    pub fn context(&self, which: ExecutionContext) -> &AllocatorContext {
        match which {
            ExecutionContext::Kernel => &self.kernel,
            ExecutionContext::Process => self.process.as_ref().unwrap_or(&self.kernel),
        }
    }

    /// The process context if there is one, otherwise the kernel context.
    pub fn current(&self) -> &AllocatorContext {
        self.context(ExecutionContext::Process)
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("kernel", &self.kernel)
            .field("process", &self.process)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mmap::MmapPageProvider, type_table::TypeDescriptor};

    fn manager() -> MemoryManager {
        MemoryManager::new(Config::default(), Arc::new(MmapPageProvider::new())).unwrap()
    }

    #[test]
    fn kernel_is_current_without_process() {
        let mm = manager();
        assert!(!mm.has_process_context());
        assert!(std::ptr::eq(mm.current(), mm.kernel()));
        assert!(mm.kernel().gc_state().is_enabled());
        assert_eq!(mm.kernel().heap().region_count(), 1);
    }

    #[test]
    fn contexts_have_separate_heaps() {
        let mut mm = manager();
        let ty = mm.types().define(TypeDescriptor::class("Thing")).unwrap();
        assert_eq!(mm.enter_new_execution_context().unwrap().map(|_| ()), None);

        let kernel_obj = mm.context(ExecutionContext::Kernel).new_object(ty).unwrap();
        let process_obj = mm.context(ExecutionContext::Process).new_object(ty).unwrap();
        let kernel = mm.kernel();
        let process = mm.process().unwrap();
        assert!(kernel.heap().contains(kernel_obj.addr()));
        assert!(!kernel.heap().contains(process_obj.addr()));
        assert!(process.heap().contains(process_obj.addr()));

        // foreign to this context's heap, so left alone
        assert_eq!(process.increment_ref_count(kernel_obj), None);
        assert_eq!(kernel.ref_count(kernel_obj), Some(1));
    }

    #[test]
    fn switching_keeps_outgoing_context_alive() {
        let mut mm = manager();
        let ty = mm.types().define(TypeDescriptor::class("Thing")).unwrap();
        mm.enter_new_execution_context().unwrap();
        let first_obj = mm.current().new_object(ty).unwrap();

        let first = mm.enter_new_execution_context().unwrap().unwrap();
        assert_eq!(first.ref_count(first_obj), Some(1));
        assert!(!mm.current().heap().contains(first_obj.addr()));

        let second = mm.restore_process_context(first).unwrap();
        assert_eq!(mm.current().ref_count(first_obj), Some(1));
        drop(second);

        let left = mm.leave_process_context().unwrap();
        assert!(left.heap().contains(first_obj.addr()));
        assert!(std::ptr::eq(mm.current(), mm.kernel()));
    }

    #[test]
    fn uninitialized_context_refuses_allocation() {
        let ctx = AllocatorContext::new(
            Config::default(),
            Arc::new(MmapPageProvider::new()),
            Default::default(),
        );
        let ty = ctx.types().define(TypeDescriptor::class("Thing")).unwrap();
        assert_eq!(ctx.new_object(ty), Err(AllocError::Disabled));
    }

    #[test]
    fn kernel_setup_fails_without_pages() {
        let result = MemoryManager::new(
            Config::default(),
            Arc::new(MmapPageProvider::with_budget(0)),
        );
        assert!(matches!(result, Err(AllocError::OutOfMemory(_))));
    }
}

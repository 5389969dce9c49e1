use std::sync::Arc;

use kgc::{
    mmap::MmapPageProvider, type_table::TypeDescriptor, AllocError, Config, ExecutionContext,
    MemoryManager,
};

fn main() -> Result<(), AllocError> {
    env_logger::init();

    let config = Config {
        verbose: true,
        ..Config::default()
    };
    let mut mm = MemoryManager::new(config, Arc::new(MmapPageProvider::new()))?;
    let node = match mm
        .types()
        .define(TypeDescriptor::class("Node").value("value", 8).reference("next"))
    {
        Ok(node) => node,
        Err(err) => {
            log::error!("{}", err);
            return Ok(());
        }
    };
    let next = mm.types().field_offset(node, "next").unwrap_or(8);

    let kernel = mm.context(ExecutionContext::Kernel);
    let greeting = kernel.new_string_from("hello from the kernel heap")?;
    kernel.increment_ref_count(greeting);
    println!("{:?}", kernel.read_string(greeting));

    mm.enter_new_execution_context()?;
    let process = mm.context(ExecutionContext::Process);
    let head = process.new_object(node)?;
    let mut tail = head;
    for _ in 0..1000 {
        let obj = process.new_object(node)?;
        if let Err(err) = process.write_field(tail, next, Some(obj)) {
            log::error!("{}", err);
        }
        process.decrement_ref_count(obj);
        tail = obj;
    }
    print!("{}", process.statistics());
    println!("{:?}", process.decrement_ref_count(head));
    println!("{:?}", process.cleanup());
    print!("{}", process.statistics());

    mm.leave_process_context();
    print!("{}", mm.kernel().statistics());
    Ok(())
}

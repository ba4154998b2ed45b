use std::process::exit;
use std::sync::Arc;

use log::{error, info};
use simnix::{
    Kernel, KernelConfig, MachineConfig, SimMachine, init_logger,
    internal::hw::MAX_NUMBER_OF_PROCESSORS,
    kprintln,
    workloads::{WORKLOADS, workload_names},
};

fn usage() -> ! {
    kprintln!("usage: simnix <workload> [M]");
    for name in workload_names() {
        kprintln!("  {:<12} {}", name, WORKLOADS[name].description);
    }
    exit(1)
}

fn main() {
    init_logger();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(name) = args.first() else {
        usage();
    };
    let Some(workload) = WORKLOADS.get(name.as_str()) else {
        error!("unknown workload: {}", name);
        usage();
    };
    let multiprocessor = args.get(1).is_some_and(|flag| flag == "M");

    info!("running workload {}: {}", name, workload.description);

    let machine = SimMachine::new(MachineConfig::default());
    let kernel = Kernel::boot(Arc::new(machine), KernelConfig::default());
    if multiprocessor {
        if let Err(err) = kernel.set_processor_count(MAX_NUMBER_OF_PROCESSORS / 2) {
            error!("could not switch to multiprocessor mode: {}", err);
            exit(1);
        }
    }
    let entry = workload.entry;
    if let Err(err) = kernel.run(name, Box::new(move |kernel| entry(kernel))) {
        error!("could not start workload {}: {}", name, err);
        exit(1);
    }
}

//! Prints the discovered topology and bound uncore inventory.

use pcm_core::Pcm;

fn main() {
    tracing_subscriber::fmt::init();

    let pcm = match Pcm::new() {
        Ok(pcm) => pcm,
        Err(e) => {
            eprintln!("failed to initialize: {e}");
            std::process::exit(1);
        }
    };

    println!("sockets: {}", pcm.topology().num_sockets);
    println!("physical cores per socket: {}", pcm.topology().num_phys_cores_per_socket);
    println!("threads per core: {}", pcm.topology().threads_per_core);
    println!();
    println!("{:>6} {:>6} {:>6} {:>6} {:>10}", "os_id", "socket", "core", "thread", "core_type");
    for entry in &pcm.topology().entries {
        println!(
            "{:>6} {:>6} {:>6} {:>6} {:>10?}",
            entry.os_id, entry.socket_id, entry.core_id, entry.thread_id, entry.core_type
        );
    }
    if !pcm.topology().offline_os_ids.is_empty() {
        println!("offline: {:?}", pcm.topology().offline_os_ids);
    }
}

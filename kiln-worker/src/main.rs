use kiln_scheduler::CompilerBackendRegistryBuilder;

// Hosts no compiler backends, so every batch is answered with CantFindBackend. Applications link
// their backends into their own worker executable and call `kiln_worker::worker_main`, as
// demo-worker does.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Always)
        .init();

    kiln_worker::worker_main(CompilerBackendRegistryBuilder::default().build());
}

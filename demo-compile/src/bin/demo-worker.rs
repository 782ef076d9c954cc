fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .write_style(env_logger::WriteStyle::Always)
        .init();

    kiln::worker::worker_main(demo_compile::backends());
}

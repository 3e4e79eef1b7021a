mod adapters;
mod app;
mod core;
mod domain;
#[cfg(test)]
mod test_support;

fn main() {
    if let Err(err) = app::run() {
        eprintln!("application startup failed: {err}");
        std::process::exit(1);
    }
}

use std::time::Duration;

use msptir::{Context, activity, instrument};
use msptir_example_utils::SyntheticDevices;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::level_filters::LevelFilter::DEBUG)
        .init();

    let context = Context::builder()
        .with_kinds([
            activity::Kind::Marker,
            activity::Kind::Kernel,
            activity::Kind::Memcpy,
        ])
        .with_record_buffer_handler(|buffer| {
            buffer
                .into_iter()
                .for_each(|record| println!("{:#?}", record.unwrap()));
            Ok(())
        })
        .buffer_size(4096)
        .with_job_factory(std::sync::Arc::new(
            SyntheticDevices::new(Duration::from_millis(1)).with_records_per_job(5),
        ))
        .with_devices([0])
        .build()?;

    let range = instrument::range_start(context.manager(), "synthetic workload", None)?;
    std::thread::sleep(Duration::from_millis(20));
    instrument::range_end(context.manager(), range)?;

    println!("dropped records: {}", context.manager().dropped_records());

    Ok(())
}

use msptir::{
    Context,
    activity::{ExternalKind, Kind, Record},
    instrument::ApiSpan,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let context = Context::builder()
        .with_kinds([Kind::Api, Kind::ExternalCorrelation])
        .with_record_buffer_handler(|buffer| {
            for record in buffer {
                match record? {
                    Record::ExternalCorrelation(record) => println!(
                        "{:?} {} -> correlation {}",
                        record.external_kind, record.external_id, record.correlation_id
                    ),
                    Record::Api(record) => println!(
                        "api {} ({} ns), correlation {}",
                        record.name.unwrap_or_default(),
                        record.end - record.start,
                        record.correlation_id
                    ),
                    other => println!("{other:?}"),
                }
            }
            Ok(())
        })
        .build()?;
    let manager = context.manager();

    for step in 0..3 {
        manager.push_external_correlation_id(ExternalKind::Custom0, step)?;
        {
            let _span = ApiSpan::enter(manager, "aclrtLaunchKernel")?;
        }
        manager.pop_external_correlation_id(ExternalKind::Custom0)?;
    }

    Ok(())
}

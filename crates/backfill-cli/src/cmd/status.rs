use backfill_core::cluster::{Cluster, PoolRef};
use backfill_core::image::ImageHandle;
use backfill_core::metadata::{self, SchedulingRecord};
use backfill_types::error::{BackfillError, Result};
use backfill_types::image_spec::ImageSpec;

use crate::table::TableStyle;

/// Scheduling records for one image, or for every image that carries
/// backfill keys in `pool` (all pools when `None`).
pub(crate) fn collect_records(
    cluster: &dyn Cluster,
    pool: Option<&str>,
    image: Option<&str>,
) -> Result<Vec<SchedulingRecord>> {
    if let Some(image) = image {
        let spec: ImageSpec = image.parse()?;
        if pool.is_some_and(|p| p != spec.pool_name) {
            return Err(BackfillError::InvalidArgument(format!(
                "image '{spec}' is not in pool '{}'",
                pool.unwrap_or_default()
            )));
        }
        let handle = ImageHandle::open(cluster, &spec)?;
        return Ok(vec![metadata::scheduling_record(&handle)?]);
    }

    let pools: Vec<String> = match pool {
        Some(p) => vec![p.to_string()],
        None => cluster.list_pools()?.into_iter().map(|p| p.name).collect(),
    };
    let mut records = Vec::new();
    for pool in pools {
        let io = cluster.io_ctx(&PoolRef::Name(pool.clone()), "")?;
        for entry in io.list_images()? {
            let handle = match ImageHandle::from_io(io.clone(), &entry.name, &entry.id) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(pool = %pool, image = %entry.name, error = %e, "cannot open image");
                    continue;
                }
            };
            let record = metadata::scheduling_record(&handle)?;
            if record.scheduled || record.status.is_some() {
                records.push(record);
            }
        }
    }
    records.sort_by(|a, b| a.image.cmp(&b.image));
    Ok(records)
}

fn parent_label(record: &SchedulingRecord) -> String {
    match (&record.remote_cluster, record.s3_parent) {
        (_, true) => "s3".to_string(),
        (Some(cluster), false) => format!("remote:{cluster}"),
        (None, false) => "-".to_string(),
    }
}

pub(crate) fn render_table(records: &[SchedulingRecord], style: TableStyle) -> String {
    let mut table = style.table(&["IMAGE", "SCHEDULED", "STATUS", "PARENT"]);
    for r in records {
        table.add_row(vec![
            r.image.clone(),
            if r.scheduled { "yes" } else { "no" }.to_string(),
            r.status.map_or("-", |s| s.as_str()).to_string(),
            parent_label(r),
        ]);
    }
    table.to_string()
}

pub(crate) fn run_status(
    cluster: &dyn Cluster,
    pool: Option<&str>,
    image: Option<&str>,
    json: bool,
) -> Result<()> {
    let records = collect_records(cluster, pool, image)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No images scheduled for backfill.");
    } else {
        println!("{}", render_table(&records, TableStyle::detect()));
    }
    Ok(())
}

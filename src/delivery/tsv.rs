use super::{Delivery, DeliveryTarget};
use crate::error::WatchError;
use crate::models::{ListingRecord, ScopeId};
use async_trait::async_trait;
use chrono::Local;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub const TSV_HEADER: [&str; 9] = [
    "dt",
    "id",
    "title",
    "url",
    "dispo",
    "locality",
    "area_m2",
    "price_czk",
    "price_per_m2",
];

/// Appends every delivered listing to `log_dir/listings_<scope>.tsv`.
pub struct TsvLogDelivery {
    dir: PathBuf,
}

impl TsvLogDelivery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(dir: &Path, scope: &ScopeId) -> PathBuf {
        dir.join(format!("listings_{}.tsv", scope))
    }

    fn append(&self, scope: &ScopeId, record: &ListingRecord) -> Result<(), WatchError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| WatchError::io(&self.dir, e))?;
        let path = Self::path_for(&self.dir, scope);
        let fresh = !path.exists();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| WatchError::io(&path, e))?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(file);

        let to_delivery = |e: csv::Error| WatchError::Delivery(format!("{:?}: {}", path, e));
        if fresh {
            writer.write_record(TSV_HEADER).map_err(to_delivery)?;
        }
        writer
            .write_record(row(record))
            .map_err(to_delivery)?;
        writer
            .flush()
            .map_err(|e| WatchError::io(&path, e))
    }
}

fn row(record: &ListingRecord) -> [String; 9] {
    let opt = |v: Option<String>| v.unwrap_or_default();
    [
        Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        record.id().to_string(),
        record.title.replace(['\t', '\n'], " "),
        record.url.clone(),
        opt(record.dispo.clone()),
        opt(record.locality.clone()),
        opt(record.area_m2.map(|a| a.to_string())),
        opt(record.price_czk.map(|p| p.to_string())),
        opt(record.price_per_m2.map(|p| p.to_string())),
    ]
}

#[async_trait]
impl Delivery for TsvLogDelivery {
    async fn deliver(
        &self,
        target: &DeliveryTarget,
        record: &ListingRecord,
    ) -> Result<(), WatchError> {
        self.append(&target.scope, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::tests::{record, target};

    #[tokio::test]
    async fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TsvLogDelivery::new(dir.path().join("logs"));

        let mut first = record("3713540940", Some(25_000));
        first.area_m2 = Some(54.0);
        first.dispo = Some("2+kk".into());
        sink.deliver(&target(), &first).await.unwrap();
        sink.deliver(&target(), &record("3713540941", None)).await.unwrap();

        let raw = std::fs::read_to_string(TsvLogDelivery::path_for(
            &dir.path().join("logs"),
            &target().scope,
        ))
        .unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], TSV_HEADER.join("\t"));

        let cols: Vec<&str> = lines[1].split('\t').collect();
        assert_eq!(cols[1], "3713540940");
        assert_eq!(cols[4], "2+kk");
        assert_eq!(cols[6], "54");
        assert_eq!(cols[7], "25000");
        assert_eq!(lines[2].split('\t').nth(7), Some(""));
    }
}

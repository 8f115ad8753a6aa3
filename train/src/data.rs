//! Dataset loading, label reconciliation and the train/validation split.

use crate::{common::*, config::Config};
use yolo_v3::dataset::load_annot_dir;

/// The fraction of records kept for training when no validation folder
/// is configured.
pub const SPLIT_RATIO: f64 = 0.8;

/// The training and validation records with the resolved class set.
#[derive(Debug)]
pub struct TrainingData {
    pub train: Vec<Arc<ImageAnnotation>>,
    pub valid: Vec<Arc<ImageAnnotation>>,
    pub classes: Arc<IndexSet<String>>,
}

impl TrainingData {
    /// Loads the annotation folders and reconciles the configured labels
    /// against the labels observed in the training annotations.
    ///
    /// Returns `None` when a configured label never occurs in the
    /// annotations; the caller is expected to abort.
    pub fn load(config: &Config, rng: &mut impl Rng) -> Result<Option<Self>> {
        let (mut train, seen_labels) = load_annot_dir(
            &config.train.train_annot_folder,
            &config.train.train_image_folder,
        )?;

        let valid = if config.valid.valid_annot_folder.is_dir() {
            let (valid, _) = load_annot_dir(
                &config.valid.valid_annot_folder,
                &config.valid.valid_image_folder,
            )?;
            valid
        } else {
            warn!(
                "validation annotation folder '{}' not found, splitting the training set {}/{}",
                config.valid.valid_annot_folder.display(),
                (SPLIT_RATIO * 100.0) as usize,
                100 - (SPLIT_RATIO * 100.0) as usize
            );
            split_annotations(&mut train, SPLIT_RATIO, rng)
        };

        let classes = match resolve_classes(&config.model.labels, &seen_labels) {
            Some(classes) => classes,
            None => return Ok(None),
        };

        Ok(Some(Self {
            train,
            valid,
            classes: Arc::new(classes),
        }))
    }
}

/// Reconciles the configured label list with the labels observed in the
/// training annotations.
///
/// - An empty configured list selects every observed label, sorted.
/// - When every configured label was observed, the configured order wins.
/// - A configured label with no annotation yields `None`.
pub fn resolve_classes(
    given: &[String],
    seen: &IndexMap<String, usize>,
) -> Option<IndexSet<String>> {
    if given.is_empty() {
        info!("no labels configured, training on every label found in the annotations");
        let mut names: Vec<_> = seen.keys().cloned().collect();
        names.sort();
        return Some(names.into_iter().collect());
    }

    let missing: Vec<_> = given
        .iter()
        .filter(|name| !seen.contains_key(*name))
        .collect();
    if !missing.is_empty() {
        error!("configured labels with no annotation: {:?}", missing);
        error!(
            "observed labels: {:?}",
            seen.iter()
                .map(|(name, count)| format!("{} ({})", name, count))
                .collect::<Vec<_>>()
        );
        error!("configured labels: {:?}", given);
        return None;
    }

    let ignored: Vec<_> = seen
        .keys()
        .filter(|name| !given.contains(*name))
        .collect();
    if !ignored.is_empty() {
        warn!("labels present in the annotations but not trained on: {:?}", ignored);
    }

    Some(given.iter().cloned().collect())
}

/// Shuffles the records in place and splits off the validation tail.
pub fn split_annotations(
    records: &mut Vec<Arc<ImageAnnotation>>,
    ratio: f64,
    rng: &mut impl Rng,
) -> Vec<Arc<ImageAnnotation>> {
    records.shuffle(rng);
    let split_index = (ratio * records.len() as f64) as usize;
    records.split_off(split_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seen(labels: &[(&str, usize)]) -> IndexMap<String, usize> {
        labels
            .iter()
            .map(|&(name, count)| (name.to_owned(), count))
            .collect()
    }

    fn given(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|&name| name.to_owned()).collect()
    }

    #[test]
    fn empty_label_list_selects_every_seen_label_sorted() {
        let classes = resolve_classes(&[], &seen(&[("dog", 3), ("cat", 5)])).unwrap();
        let classes: Vec<_> = classes.iter().cloned().collect();
        assert_eq!(classes, vec!["cat".to_owned(), "dog".to_owned()]);
    }

    #[test]
    fn configured_labels_keep_their_order() {
        let classes = resolve_classes(
            &given(&["dog", "cat"]),
            &seen(&[("cat", 5), ("dog", 3), ("bird", 1)]),
        )
        .unwrap();
        let classes: Vec<_> = classes.iter().cloned().collect();
        assert_eq!(classes, vec!["dog".to_owned(), "cat".to_owned()]);
    }

    #[test]
    fn unobserved_configured_label_resolves_to_none() {
        let classes = resolve_classes(&given(&["cat", "horse"]), &seen(&[("cat", 5)]));
        assert!(classes.is_none());
    }

    fn dummy_records(count: usize) -> Vec<Arc<ImageAnnotation>> {
        (0..count)
            .map(|index| {
                Arc::new(ImageAnnotation {
                    path: PathBuf::from(format!("{:06}.jpg", index)),
                    height: 416,
                    width: 416,
                    objects: vec![],
                })
            })
            .collect()
    }

    #[test]
    fn split_is_disjoint_and_covers_the_input() {
        let mut train = dummy_records(10);
        let mut rng = StdRng::seed_from_u64(42);
        let valid = split_annotations(&mut train, SPLIT_RATIO, &mut rng);

        assert_eq!(train.len(), 8);
        assert_eq!(valid.len(), 2);

        let mut paths: Vec<_> = train
            .iter()
            .chain(&valid)
            .map(|record| record.path.clone())
            .collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 10);
    }

    #[test]
    fn split_rounds_down_the_training_share() {
        let mut train = dummy_records(7);
        let mut rng = StdRng::seed_from_u64(0);
        let valid = split_annotations(&mut train, SPLIT_RATIO, &mut rng);
        assert_eq!(train.len(), 5);
        assert_eq!(valid.len(), 2);
    }
}

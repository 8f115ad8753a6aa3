use super::{ImageAnnotation, NamedBox};
use crate::{bbox::RatioRect, common::*};
use voc_dataset as voc;

/// Parses every VOC XML file under `annot_dir` and pairs it with the image
/// of the same file name under `image_dir`.
///
/// Returns the parsed records along with the histogram of observed class
/// names.
pub fn load_annot_dir<P1, P2>(
    annot_dir: P1,
    image_dir: P2,
) -> Result<(Vec<Arc<ImageAnnotation>>, IndexMap<String, usize>)>
where
    P1: AsRef<Path>,
    P2: AsRef<Path>,
{
    let annot_dir = annot_dir.as_ref();
    let image_dir = image_dir.as_ref();

    let xml_files: Vec<PathBuf> = glob::glob(&format!("{}/*.xml", annot_dir.display()))?
        .map(|result| Ok(result?))
        .collect::<Result<Vec<_>>>()?;
    ensure!(
        !xml_files.is_empty(),
        "no annotation files found in '{}'",
        annot_dir.display()
    );

    let mut seen_labels: IndexMap<String, usize> = IndexMap::new();
    let records: Vec<_> = xml_files
        .into_iter()
        .map(|annotation_file| -> Result<_> {
            let xml_content = std::fs::read_to_string(&annotation_file).with_context(|| {
                format!(
                    "failed to read annotation file {}",
                    annotation_file.display()
                )
            })?;
            let annotation: voc::Annotation =
                serde_xml_rs::from_str(&xml_content).with_context(|| {
                    format!(
                        "failed to parse annotation file {}",
                        annotation_file.display()
                    )
                })?;

            let voc::Size { width, height, .. } = annotation.size;
            let objects: Vec<_> = annotation
                .object
                .iter()
                .map(|object| -> Result<_> {
                    let voc::BndBox {
                        xmin,
                        ymin,
                        xmax,
                        ymax,
                    } = object.bndbox;
                    let rect = RatioRect::from_pixel_tlbr(
                        f64::from(ymin),
                        f64::from(xmin),
                        f64::from(ymax),
                        f64::from(xmax),
                        height as f64,
                        width as f64,
                    )
                    .with_context(|| {
                        format!(
                            "invalid bounding box in annotation file {}",
                            annotation_file.display()
                        )
                    })?;
                    Ok(NamedBox {
                        name: object.name.clone(),
                        rect,
                    })
                })
                .try_collect()?;

            objects.iter().for_each(|object| {
                *seen_labels.entry(object.name.clone()).or_insert(0) += 1;
            });

            let image_file = image_dir.join(&annotation.filename);
            Ok(Arc::new(ImageAnnotation {
                path: image_file,
                height,
                width,
                objects,
            }))
        })
        .try_collect()?;

    info!(
        "loaded {} annotation files from '{}' with {} distinct labels",
        records.len(),
        annot_dir.display(),
        seen_labels.len()
    );

    Ok((records, seen_labels))
}

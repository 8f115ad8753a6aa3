use crate::common::*;

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

/// The fixed file name of the pretrained backbone weights.
pub const BACKBONE_WEIGHTS_FILE: &str = "darknet53.ot";

/// Loads the starting parameters: a prior checkpoint when one exists,
/// otherwise the pretrained backbone.
///
/// Returns whether a prior checkpoint was loaded.
pub fn load_initial_weights(vs: &mut nn::VarStore, saved_weights: &Path) -> Result<bool> {
    if saved_weights.is_file() {
        info!("load weights from checkpoint '{}'", saved_weights.display());
        vs.load_partial(saved_weights)?;
        return Ok(true);
    }

    let backbone = Path::new(BACKBONE_WEIGHTS_FILE);
    if backbone.is_file() {
        info!("load pretrained backbone '{}'", backbone.display());
        vs.load_partial(backbone)?;
    } else {
        warn!(
            "pretrained backbone '{}' not found, training from random initialization",
            backbone.display()
        );
    }
    Ok(false)
}

/// Saves the parameters to the checkpoint file.
pub fn save_checkpoint(vs: &nn::VarStore, saved_weights: &Path, val_loss: f64) -> Result<()> {
    vs.save(saved_weights)?;
    info!(
        "saved checkpoint '{}' with validation loss {:.5}",
        saved_weights.display(),
        val_loss
    );
    Ok(())
}

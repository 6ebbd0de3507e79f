//! Locate the convolutional layer closest to a model's output

use log::{debug, trace};

use crate::layer::Layer;

/// Name heuristic OR structural check; either signal is enough.
pub fn is_conv_candidate(layer: &Layer) -> bool {
    layer.name.to_lowercase().contains("conv") || layer.is_conv2d()
}

/// Search `layers` output-to-input for the most specific convolutional layer.
///
/// Containers are searched before their own name is tested, so a match deep
/// inside the last backbone wins over a container or shallower sibling.
pub fn find_last_conv_layer(layers: &[Layer]) -> Option<&str> {
    for layer in layers.iter().rev() {
        trace!("checking layer {} ({})", layer.name, layer.kind());
        if let Some(children) = layer.children().filter(|c| !c.is_empty()) {
            debug!("descending into nested model {}", layer.name);
            if let Some(found) = find_last_conv_layer(children) {
                return Some(found);
            }
        }
        if is_conv_candidate(layer) {
            debug!("found conv layer {}", layer.name);
            return Some(&layer.name);
        }
    }
    None
}

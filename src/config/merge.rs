use serde_json::Value;

/// Overlays `layer` on top of `base`, in place.
///
/// Records are merged key by key; any other pair of values is resolved by
/// replacing the base value with the layer's value wholesale. Arrays are
/// replaced, never concatenated.
pub fn overlay(base: &mut Value, layer: &Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                match base.get_mut(key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, layer) => *base = layer.clone(),
    }
}

/// Folds every layer over an empty record, later layers winning per leaf.
pub fn merge_all<'a>(layers: impl IntoIterator<Item = &'a Value>) -> Value {
    let mut acc = Value::Object(Default::default());

    for layer in layers {
        // An absent fragment contributes nothing.
        if !layer.is_null() {
            overlay(&mut acc, layer);
        }
    }

    acc
}

/// Looks up a dotted path such as `solidity.settings.optimizer.runs`.
pub fn lookup<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(tree);
    }

    path.split('.')
        .try_fold(tree, |node, key| node.as_object()?.get(key))
}

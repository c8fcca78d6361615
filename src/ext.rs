use kube::ResourceExt;

pub trait ReflinkerResourceExt: ResourceExt {
    /// `namespace/name`, or `<>/name` for cluster-scoped resources.
    fn full_name(&self) -> String;
}

impl<K: ResourceExt> ReflinkerResourceExt for K {
    fn full_name(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_else(|| "<>".into()),
            self.name_any()
        )
    }
}

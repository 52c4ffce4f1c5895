use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, ModelLike};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub device_map: DeviceMap,
    /// Keep large components on the host and move them to the device per stage.
    pub offload: bool,
}

pub trait Loader {
    type Variant;
    type Model: ModelLike;

    fn load(
        variant: Self::Variant,
        api: Api,
        options: LoadOptions,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}

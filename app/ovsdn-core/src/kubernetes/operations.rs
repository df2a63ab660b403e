use std::fmt::Debug;

use k8s_openapi::ClusterResourceScope;
use kube::{Api, Client, Resource};
use serde::{de::DeserializeOwned, Serialize};

use super::GetApi;

pub async fn try_get_cluster_resource<T>(
    client: &Client,
    resource_name: &str,
) -> Result<Option<T>, kube::Error>
where
    T: Resource<Scope = ClusterResourceScope> + Serialize + Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = client.global_api();
    let response = api.get(resource_name).await;

    match response {
        Ok(resource) => Ok(Some(resource)),
        Err(error) => match &error {
            kube::Error::Api(api_error) => match api_error.code {
                404 => Ok(None),
                _ => Err(error),
            },
            _ => Err(error),
        },
    }
}

use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

pub mod operations;

pub trait GetApi {
    fn global_api<T>(&self) -> Api<T>
    where
        T: Resource<Scope = ClusterResourceScope> + Clone + DeserializeOwned,
        <T as Resource>::DynamicType: Default;

    fn namespaced_api<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned,
        <T as Resource>::DynamicType: Default;
}

impl GetApi for Client {
    fn global_api<T>(&self) -> Api<T>
    where
        T: Resource<Scope = ClusterResourceScope> + Clone + DeserializeOwned,
        <T as Resource>::DynamicType: Default,
    {
        Api::all(self.clone())
    }

    fn namespaced_api<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned,
        <T as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.clone(), namespace)
    }
}

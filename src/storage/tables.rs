//! Table bindings and filter specs for every persisted record.

use crate::domain::*;
use crate::storage::record::{impl_record, record_filter};

record_filter!(
    PackageFilter for Package {
        id: PackageId,
        name: String,
        scene: Scene,
        zone_id: ZoneId,
        cluster_name: String,
        org_id: String,
        project_id: String,
        env: String,
        runtime_service_id: String,
    }
    in { ids => id: PackageId }
);

impl_record!(Package, table = "packages", id = PackageId, filter = PackageFilter, [
    id, name, description, scene, auth_type, acl_type, zone_id, cluster_name, org_id,
    project_id, env, runtime_service_id, created_at,
]);

record_filter!(
    PackageApiFilter for PackageApi {
        id: PackageApiId,
        package_id: PackageId,
        api_path: String,
        method: String,
        redirect_type: RedirectType,
        runtime_service_id: String,
        origin: ApiOrigin,
        zone_id: String,
    }
    in { package_ids => package_id: PackageId }
);

impl_record!(PackageApi, table = "package_apis", id = PackageApiId, filter = PackageApiFilter, [
    id, package_id, api_path, method, redirect_type, redirect_addr, redirect_path,
    runtime_service_id, origin, zone_id, acl_type, description, service_id, route_id, created_at,
]);

record_filter!(
    ZoneFilter for Zone {
        id: ZoneId,
        name: String,
        zone_type: ZoneType,
        cluster_name: String,
        project_id: String,
        env: String,
        package_api_id: String,
        runtime_service_id: String,
    }
    in { ids => id: ZoneId }
);

impl_record!(Zone, table = "zones", id = ZoneId, filter = ZoneFilter, [
    id, name, zone_type, cluster_name, org_id, project_id, env, package_api_id,
    runtime_service_id, has_ingress, ingress_namespace, policies, created_at,
]);

record_filter!(
    ZonePolicyFilter for ZonePolicy {
        id: ZonePolicyId,
        zone_id: ZoneId,
        plugin_name: String,
    }
);

impl_record!(ZonePolicy, table = "zone_policies", id = ZonePolicyId, filter = ZonePolicyFilter, [
    id, zone_id, plugin_name, plugin_id, enabled, created_at,
]);

record_filter!(
    DomainFilter for DomainRecord {
        id: DomainId,
        domain: String,
        cluster_name: String,
        domain_type: DomainType,
        runtime_service_id: String,
        package_id: String,
        component_name: String,
        org_id: String,
        project_id: String,
        env: String,
    }
    in { domains => domain: String }
);

impl_record!(DomainRecord, table = "domains", id = DomainId, filter = DomainFilter, [
    id, domain, cluster_name, domain_type, runtime_service_id, package_id, package_name,
    component_name, org_id, project_id, env, created_at,
]);

record_filter!(
    PackageRuleFilter for PackageRule {
        id: RuleId,
        package_id: PackageId,
        package_api_id: String,
        package_zone_need: bool,
        category: RuleCategory,
        plugin_name: String,
        consumer_id: String,
        enabled: bool,
    }
);

impl_record!(PackageRule, table = "package_rules", id = RuleId, filter = PackageRuleFilter, [
    id, name, package_id, package_name, package_api_id, package_zone_need, category,
    plugin_name, plugin_id, config, consumer_id, consumer_name, enabled, kong_plugin, created_at,
]);

record_filter!(
    UpstreamFilter for Upstream {
        id: UpstreamId,
        org_id: String,
        project_id: String,
        env: String,
        az: String,
        upstream_name: String,
        runtime_service_id: String,
    }
);

impl_record!(Upstream, table = "upstreams", id = UpstreamId, filter = UpstreamFilter, [
    id, org_id, project_id, env, az, app_name, service_name, upstream_name,
    runtime_service_id, last_register_id, valid_register_id, auto_bind, created_at,
]);

record_filter!(
    UpstreamApiFilter for UpstreamApi {
        id: UpstreamApiId,
        upstream_id: UpstreamId,
        register_id: String,
        api_name: String,
        api_id: String,
        deleted: bool,
    }
    in { ids => id: UpstreamApiId }
);

impl_record!(UpstreamApi, table = "upstream_apis", id = UpstreamApiId, filter = UpstreamApiFilter, [
    id, upstream_id, register_id, api_name, path, gateway_path, method, address, domains,
    doc, is_inner, api_id, deleted, created_at,
]);

record_filter!(
    RegisterRecordFilter for RegisterRecord {
        id: RegisterRecordId,
        upstream_id: UpstreamId,
        register_id: String,
    }
);

impl_record!(
    RegisterRecord,
    table = "upstream_register_records",
    id = RegisterRecordId,
    filter = RegisterRecordFilter,
    [id, upstream_id, register_id, upstream_apis, created_at]
);

record_filter!(
    ConsumerFilter for Consumer {
        id: ConsumerId,
        name: String,
        org_id: String,
        project_id: String,
        env: String,
        az: String,
        is_default: bool,
    }
);

impl_record!(Consumer, table = "consumers", id = ConsumerId, filter = ConsumerFilter, [
    id, name, backend_id, org_id, project_id, env, az, is_default, created_at,
]);

record_filter!(
    GatewayApiFilter for GatewayApi {
        id: GatewayApiId,
        consumer_id: String,
        upstream_api_id: String,
        runtime_service_id: String,
        cluster_name: String,
    }
);

impl_record!(GatewayApi, table = "gateway_apis", id = GatewayApiId, filter = GatewayApiFilter, [
    id, consumer_id, api_path, method, redirect_addr, hosts, service_id, route_id,
    upstream_api_id, runtime_service_id, cluster_name, project_id, env, created_at,
]);

record_filter!(
    HubInfoFilter for HubInfo {
        id: HubInfoId,
        org_id: String,
        env: String,
        az: String,
        domains: String,
        package_id: PackageId,
    }
);

impl_record!(HubInfo, table = "hub_infos", id = HubInfoId, filter = HubInfoFilter, [
    id, org_id, env, az, domains, package_id, created_at,
]);

record_filter!(
    RuntimeServiceFilter for RuntimeService {
        id: RuntimeServiceId,
        project_id: String,
        env: String,
        cluster_name: String,
        app_id: String,
        app_name: String,
        service_name: String,
        runtime_name: String,
    }
    in { ids => id: RuntimeServiceId }
);

impl_record!(
    RuntimeService,
    table = "runtime_services",
    id = RuntimeServiceId,
    filter = RuntimeServiceFilter,
    [
        id, project_id, env, cluster_name, app_id, app_name, service_name, runtime_name,
        inner_address, service_port, group_namespace, group_name, created_at,
    ]
);

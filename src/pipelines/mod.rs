pub mod snp_cluster;
